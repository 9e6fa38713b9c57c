//! Device control commands.

use log::info;
use serde_json::Value;

use crate::pipeline::{Context, PipelineError};
use crate::services::feature_cache::DeviceKey;

#[derive(Debug, Clone)]
pub struct CommandRequest<'a> {
    pub account_id: &'a str,
    pub device: &'a DeviceKey,
    pub feature: &'a str,
    pub command: &'a str,
    pub params: &'a Value,
}

/// Executes a feature command and drops the device's cached features, so the next
/// read reflects the new state.
pub fn execute_command(ctx: &Context, req: &CommandRequest<'_>) -> Result<(), PipelineError> {
    let account = ctx.account(req.account_id)?;
    let token = ctx.tokens.ensure(&account)?;
    if token.installation(&req.device.installation_id).is_none() {
        return Err(PipelineError::UnknownInstallation(req.device.installation_id.clone()));
    }
    if !ctx.limiter.try_acquire() {
        return Err(PipelineError::RateLimited);
    }

    let result = ctx.api.execute_command(
        &token.access_token,
        &req.device.installation_id,
        &req.device.gateway_serial,
        &req.device.device_id,
        req.feature,
        req.command,
        req.params,
    );
    if let Err(e) = &result {
        if e.is_unauthorized() {
            ctx.tokens.invalidate(&account.id);
        }
    }
    result?;

    ctx.features.invalidate(req.device);
    info!("Command: {}.{} executed on {}", req.feature, req.command, req.device);
    Ok(())
}
