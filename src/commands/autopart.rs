//! `autopart`: the default layout, optionally encrypted.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::RunContext;
use crate::encryption::EncryptionRequest;
use crate::engine::{AutoPartPlan, StorageEngine};
use crate::error::{AtLine, Result};
use crate::types::AutoPartType;

/// The `autopart` line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoPartRequest {
    pub line: usize,
    #[serde(rename = "type")]
    pub kind: AutoPartType,
    pub encryption: Option<EncryptionRequest>,
}

pub fn execute(engine: &mut dyn StorageEngine, ctx: &mut RunContext, req: &AutoPartRequest) -> Result<()> {
    let line = req.line;
    let encryption = match &req.encryption {
        Some(request) => Some(request.settings(ctx, line)?),
        None => None,
    };
    let plan = AutoPartPlan { kind: req.kind, encryption };
    info!(
        "line {}: automatic partitioning ({}{})",
        line,
        req.kind,
        if plan.encryption.is_some() { ", encrypted" } else { "" }
    );
    engine.auto_partition(&plan).at_line(line)?;
    for warning in engine.sanity_check().at_line(line)? {
        warn!("{}", warning);
    }
    Ok(())
}
