//! The built-in plan for the QO-100 dish alignment appliance.

use anyhow::Result;

use crate::plan::config::PlanDocument;

pub const APPLIANCE_PLAN: &str = include_str!("../plans/appliance.toml");
pub const APPLIANCE_ORIGIN: &str = "built-in appliance plan";

pub fn document() -> Result<PlanDocument> {
    PlanDocument::parse(APPLIANCE_PLAN, APPLIANCE_ORIGIN)
}
