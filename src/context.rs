//! Run-scoped state shared by the command handlers
//!
//! One `RunContext` lives for exactly one run. Nothing here is global, so two
//! runs in the same process never see each other's aliases, certificates or
//! default passphrase.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::encryption::CertificateCache;
use crate::error::{KickstartError, Result};
use crate::network::{self, EscrowFetcher};
use crate::types::Placeholder;

/// Symbolic name → concrete device name.
///
/// Keys are placeholder names (`pv.01`, `raid.home`) and requested volume
/// group names. An entry is never overwritten within a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasTable {
    entries: BTreeMap<String, String>,
}

impl AliasTable {
    /// Record `symbolic` → `concrete`; a second registration of the same name is rejected.
    pub fn register(&mut self, line: usize, symbolic: &str, concrete: &str) -> Result<()> {
        if let Some(existing) = self.entries.get(symbolic) {
            return Err(KickstartError::validation(
                line,
                format!("{} is defined multiple times (already bound to {})", symbolic, existing),
            ));
        }
        debug!("alias {} -> {}", symbolic, concrete);
        self.entries.insert(symbolic.to_string(), concrete.to_string());
        Ok(())
    }

    pub fn get(&self, symbolic: &str) -> Option<&str> {
        self.entries.get(symbolic).map(String::as_str)
    }

    pub fn contains(&self, symbolic: &str) -> bool {
        self.entries.contains_key(symbolic)
    }

    /// Returns true if any placeholder with this label has been registered.
    pub fn contains_label(&self, label: &str) -> bool {
        self.entries
            .keys()
            .filter_map(|k| Placeholder::parse(k))
            .any(|p| p.label == label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// State threaded through every handler call of one run.
pub struct RunContext {
    pub aliases: AliasTable,
    pub certificates: CertificateCache,
    default_passphrase: Option<String>,
    fetcher: Box<dyn EscrowFetcher>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("aliases", &self.aliases)
            .field("certificates", &self.certificates)
            .field("default_passphrase", &self.default_passphrase.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(network::default_fetcher())
    }
}

impl RunContext {
    pub fn new(fetcher: Box<dyn EscrowFetcher>) -> Self {
        Self {
            aliases: AliasTable::default(),
            certificates: CertificateCache::default(),
            default_passphrase: None,
            fetcher,
        }
    }

    /// Context that never touches the network.
    pub fn offline() -> Self {
        Self::new(Box::new(network::OfflineFetcher))
    }

    /// Passphrase for one encryption request.
    ///
    /// The first explicit passphrase of the run becomes the default for every
    /// later request that gives none.
    pub fn passphrase_for(&mut self, explicit: Option<&str>) -> Option<String> {
        match explicit.filter(|p| !p.is_empty()) {
            Some(passphrase) => {
                if self.default_passphrase.is_none() {
                    info!("using the first encryption passphrase as the default for this run");
                    self.default_passphrase = Some(passphrase.to_string());
                }
                Some(passphrase.to_string())
            }
            None => self.default_passphrase.clone(),
        }
    }

    pub fn default_passphrase(&self) -> Option<&str> {
        self.default_passphrase.as_deref()
    }

    /// Certificate bytes for an escrow URL, fetched at most once per run.
    pub fn escrow_certificate(&mut self, line: usize, url: &str) -> Result<Vec<u8>> {
        self.certificates.get_or_fetch(line, url, self.fetcher.as_mut())
    }
}
