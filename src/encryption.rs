//! Encryption layering
//!
//! `wrap` puts a LUKS layer on top of a device or pending request: the backing
//! device gets a `luks` format and a new LUKS device, whose only parent is the
//! backing device, carries the format the caller asked for.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::RunContext;
use crate::engine::{DeviceId, DeviceRequest, Format, LuksSettings, StorageEngine};
use crate::error::{AtLine, KickstartError, Result};
use crate::network::{is_local_url, EscrowFetcher};

/// Encryption options attached to one partition, array or volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionRequest {
    /// Omitted: the first passphrase given earlier in the run is used
    pub passphrase: Option<String>,
    pub crypted: bool,
    pub cipher: Option<String>,
    /// URL (or local path) of the escrow certificate
    pub escrow_cert: Option<String>,
    pub backup_passphrase: bool,
}

impl EncryptionRequest {
    /// Resolve passphrase default and escrow certificate into engine settings.
    pub fn settings(&self, ctx: &mut RunContext, line: usize) -> Result<LuksSettings> {
        let escrow_cert = match &self.escrow_cert {
            Some(url) => Some(ctx.escrow_certificate(line, url)?),
            None => None,
        };
        Ok(LuksSettings {
            passphrase: ctx.passphrase_for(self.passphrase.as_deref()),
            crypted: self.crypted,
            cipher: self.cipher.clone(),
            escrow_cert,
            add_backup_passphrase: self.backup_passphrase,
        })
    }
}

/// Escrow URL → certificate bytes, one download per URL per run.
#[derive(Debug, Clone, Default)]
pub struct CertificateCache {
    certs: BTreeMap<String, Vec<u8>>,
}

impl CertificateCache {
    pub fn get_or_fetch(
        &mut self,
        line: usize,
        url: &str,
        fetcher: &mut dyn EscrowFetcher,
    ) -> Result<Vec<u8>> {
        if let Some(cert) = self.certs.get(url) {
            debug!("escrow certificate {} served from cache", url);
            return Ok(cert.clone());
        }

        let cert = if is_local_url(url) {
            read_local(url).map_err(|e| KickstartError::network(line, e))?
        } else {
            if !fetcher.network_state(url).is_online() {
                return Err(KickstartError::network(
                    line,
                    format!("Escrow certificate {} requires the network.", url),
                ));
            }
            fetcher.fetch(url).map_err(|e| KickstartError::network(line, e))?
        };

        info!("fetched escrow certificate {} ({} bytes)", url, cert.len());
        self.certs.insert(url.to_string(), cert.clone());
        Ok(cert)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.certs.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

fn read_local(url: &str) -> std::result::Result<Vec<u8>, String> {
    let path = url
        .strip_prefix("file://")
        .or_else(|| url.strip_prefix("file:"))
        .unwrap_or(url);
    std::fs::read(path).map_err(|e| format!("failed to read escrow certificate {}: {}", path, e))
}

/// Layer an encryption device over `target`.
///
/// `inner` is the format the caller wants to end up with (file system, swap,
/// PV signature, ...); it moves to the new LUKS device together with its mount
/// point. Returns the LUKS device.
pub fn wrap(
    engine: &mut dyn StorageEngine,
    ctx: &mut RunContext,
    target: DeviceId,
    inner: Format,
    request: &EncryptionRequest,
    line: usize,
) -> Result<DeviceId> {
    let settings = request.settings(ctx, line)?;
    let info = engine
        .device(target)
        .ok_or_else(|| KickstartError::state(line, format!("device {} vanished before encryption", target)))?;

    let luks = Format::luks(settings);
    if info.exists {
        engine.create_format(target, luks).at_line(line)?;
    } else {
        engine.replace_format(target, luks).at_line(line)?;
    }

    let layered = engine
        .create_device(DeviceRequest::Luks { parent: target, format: inner })
        .at_line(line)?;
    debug!("encrypted {} with a new LUKS layer", info.name);
    Ok(layered)
}
