//! Service configuration, built in code or loaded from TOML
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::billing::Tariff;
use crate::party::{Identity, Party, PublicKey, Role};

/// The regulator every account names, resolved once at start up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegulatorConfig {
    pub name: String,
    pub public_key: String, // hex encoded ed25519 key
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub role: Role,
    /// Omitted on the regulator's own node.
    #[serde(default)]
    pub regulator: Option<RegulatorConfig>,
    /// Hex encoded 32 byte signing seed. A fresh key is generated when absent.
    #[serde(default)]
    pub signing_seed: Option<String>,
    #[serde(default)]
    pub tariff_per_unit: Option<Tariff>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_accept_transfers")]
    pub accept_transfers: bool,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("energy-account.db")
}

fn default_log_filter() -> String {
    "energy_account=info".to_string()
}

fn default_accept_transfers() -> bool {
    true
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            regulator: None,
            signing_seed: None,
            tariff_per_unit: None,
            db_path: default_db_path(),
            log_filter: default_log_filter(),
            accept_transfers: default_accept_transfers(),
        }
    }
    pub fn set_regulator(mut self, regulator: &Party) -> Self {
        self.regulator = Some(RegulatorConfig {
            name: regulator.name.clone(),
            public_key: regulator.key.to_hex(),
        });
        self
    }
    pub fn set_tariff(mut self, tariff: Tariff) -> Self {
        self.tariff_per_unit = Some(tariff);
        self
    }
    pub fn set_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }
    pub fn set_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }
    pub fn set_accept_transfers(mut self, accept: bool) -> Self {
        self.accept_transfers = accept;
        self
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// The signing identity for this node.
    pub fn identity(&self) -> anyhow::Result<Identity> {
        match &self.signing_seed {
            Some(seed) => {
                let seed: [u8; 32] = hex::decode(seed)?
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("signing seed must be 32 bytes"))?;
                Ok(Identity::from_seed(self.name.clone(), self.role, seed))
            }
            None => Ok(Identity::generate(self.name.clone(), self.role)),
        }
    }

    /// Resolves the regulator identity. On the regulator's own node that is `own`.
    pub fn regulator(&self, own: &Party) -> anyhow::Result<Party> {
        match (&self.regulator, self.role) {
            (_, Role::Regulator) => Ok(own.clone()),
            (Some(regulator), Role::Supplier) => Ok(Party::new(
                regulator.name.clone(),
                Role::Regulator,
                PublicKey::from_hex(&regulator.public_key)?,
            )),
            (None, Role::Supplier) => Err(anyhow::anyhow!(
                "supplier {} has no regulator configured",
                self.name
            )),
        }
    }
}
