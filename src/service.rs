//! Service layer API for account operations run by one party's node
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::account::{AccountId, AccountRecord, Amount, CustomerDetails, TimeStamp};
use crate::billing::{EntryKind, derive_consumption_charge};
use crate::config::ServiceConfig;
use crate::contract::Transition;
use crate::error::AccountError;
use crate::network::Network;
use crate::party::{Identity, Party, Role};
use crate::protocol::{run_initiator, run_responder};
use crate::store::{RecordStore, SledRecordStore, StoredVersion};
use crate::transaction::SignedTransition;

/// One request against the ledger, carrying exactly what its operation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountRequest {
    Create {
        customer: CustomerDetails,
    },
    Modify {
        id: AccountId,
        customer: CustomerDetails,
    },
    Transfer {
        id: AccountId,
        new_supplier: Party,
    },
    Delete {
        id: AccountId,
    },
    MeterRead {
        id: AccountId,
        units: u64,
        timestamp: Option<TimeStamp<Utc>>,
    },
    BillingEntry {
        id: AccountId,
        kind: EntryKind,
        timestamp: Option<TimeStamp<Utc>>,
    },
}

pub struct AccountService {
    identity: Arc<Identity>,
    config: ServiceConfig,
    regulator: Party,
    store: Arc<dyn RecordStore>,
    network: Network,
}

impl AccountService {
    /// Builds a node from its configuration, opening the sled store at `db_path`.
    pub fn open(config: ServiceConfig, network: Network) -> Result<Self, AccountError> {
        let identity = config.identity()?;
        let store = SledRecordStore::open(&config.db_path)?;
        Self::with_identity(identity, config, Arc::new(store), network)
    }

    pub fn with_identity(
        identity: Identity,
        config: ServiceConfig,
        store: Arc<dyn RecordStore>,
        network: Network,
    ) -> Result<Self, AccountError> {
        let regulator = config.regulator(identity.party())?;
        Ok(Self {
            identity: Arc::new(identity),
            config,
            regulator,
            store,
            network,
        })
    }

    pub fn party(&self) -> &Party {
        self.identity.party()
    }

    pub fn regulator(&self) -> &Party {
        &self.regulator
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Makes this node reachable and answers every incoming session on its own task.
    pub fn spawn_responder(&self) -> JoinHandle<()> {
        let mut inbox = self.network.register(self.party().clone());
        let identity = Arc::clone(&self.identity);
        let store = Arc::clone(&self.store);
        let accept_transfers = self.config.accept_transfers;

        tokio::spawn(async move {
            while let Some(incoming) = inbox.recv().await {
                let identity = Arc::clone(&identity);
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let initiator = incoming.initiator().clone();
                    if let Err(e) =
                        run_responder(&identity, store.as_ref(), accept_transfers, incoming).await
                    {
                        tracing::warn!(party = %identity.party(), %initiator, error = %e, "responder session failed");
                    }
                });
            }
        })
    }

    pub async fn execute(&self, request: AccountRequest) -> Result<Option<AccountRecord>, AccountError> {
        match request {
            AccountRequest::Create { customer } => self.create_account(customer).await.map(Some),
            AccountRequest::Modify { id, customer } => self.modify_account(&id, customer).await.map(Some),
            AccountRequest::Transfer { id, new_supplier } => {
                self.transfer_account(&id, new_supplier).await.map(Some)
            }
            AccountRequest::Delete { id } => self.delete_account(&id).await.map(|_| None),
            AccountRequest::MeterRead { id, units, timestamp } => {
                self.submit_meter_reading(&id, units, timestamp).await.map(Some)
            }
            AccountRequest::BillingEntry { id, kind, timestamp } => {
                self.submit_billing_entry(&id, kind, timestamp).await.map(Some)
            }
        }
    }

    /// Opens a new account supplied by this node.
    pub async fn create_account(&self, customer: CustomerDetails) -> Result<AccountRecord, AccountError> {
        if self.party().role != Role::Supplier {
            return Err(AccountError::Authorization(format!(
                "{} is not a supplier and cannot open accounts",
                self.party()
            )));
        }

        let transition = Transition::create(self.regulator.clone(), self.party().clone(), customer)?;
        let stx = self.propose(transition).await?;
        produced(stx)
    }

    pub async fn modify_account(
        &self,
        id: &AccountId,
        customer: CustomerDetails,
    ) -> Result<AccountRecord, AccountError> {
        let account = self.load_current(id)?;
        self.ensure_supplier(&account)?;

        let stx = self.propose(Transition::modify(&account, customer)).await?;
        produced(stx)
    }

    /// Hands the account to `new_supplier`, who must counter-sign.
    pub async fn transfer_account(
        &self,
        id: &AccountId,
        new_supplier: Party,
    ) -> Result<AccountRecord, AccountError> {
        if new_supplier.role != Role::Supplier {
            return Err(AccountError::InvalidRequest(format!(
                "{new_supplier} is not a supplier"
            )));
        }
        let account = self.load_current(id)?;
        self.ensure_supplier(&account)?;

        let stx = self.propose(Transition::transfer(&account, new_supplier)).await?;
        produced(stx)
    }

    /// Closes the account. The regulator may also close accounts it holds.
    pub async fn delete_account(&self, id: &AccountId) -> Result<(), AccountError> {
        let account = self.load_current(id)?;
        if !self.party().is_regulator() {
            self.ensure_supplier(&account)?;
        }

        self.propose(Transition::delete(&account)).await?;
        Ok(())
    }

    /// Appends a meter reading, stamped now unless `timestamp` is given.
    pub async fn submit_meter_reading(
        &self,
        id: &AccountId,
        units: u64,
        timestamp: Option<TimeStamp<Utc>>,
    ) -> Result<AccountRecord, AccountError> {
        let account = self.load_current(id)?;
        self.ensure_supplier(&account)?;

        let stx = self.propose(Transition::meter_read(&account, units, timestamp)).await?;
        produced(stx)
    }

    /// Appends a billing entry. Standard entries are priced from the meter
    /// history at this node's tariff.
    pub async fn submit_billing_entry(
        &self,
        id: &AccountId,
        kind: EntryKind,
        timestamp: Option<TimeStamp<Utc>>,
    ) -> Result<AccountRecord, AccountError> {
        let account = self.load_current(id)?;
        self.ensure_supplier(&account)?;

        let (description, amount) = self.price_entry(&account, kind)?;
        let transition = Transition::billing_entry(&account, description, amount, timestamp)?;
        let stx = self.propose(transition).await?;
        produced(stx)
    }

    fn price_entry(&self, account: &AccountRecord, kind: EntryKind) -> Result<(String, Amount), AccountError> {
        match kind {
            EntryKind::Standard { description } => {
                let tariff = self.config.tariff_per_unit.ok_or_else(|| {
                    AccountError::InvalidRequest(format!("{} has no tariff configured", self.party()))
                })?;
                let charge = derive_consumption_charge(
                    account.meter_readings(),
                    account.billing_entries(),
                    tariff,
                    description.as_deref(),
                )?;
                tracing::debug!(
                    account = %account.id(),
                    units = charge.units_consumed,
                    amount = %charge.amount,
                    "derived standard bill"
                );
                Ok((charge.description, charge.amount))
            }
            EntryKind::Adjust { description, amount } => {
                if description.trim().is_empty() {
                    return Err(AccountError::InvalidRequest(
                        "an adjustment needs a description".into(),
                    ));
                }
                Ok((description, amount))
            }
        }
    }

    /// The current version of `id`, or `None` when this node may not see it.
    pub fn get_account(&self, id: &AccountId) -> Result<Option<AccountRecord>, AccountError> {
        Ok(self.store.current(id)?.filter(|account| self.can_see(account)))
    }

    /// Every current version visible to this node.
    pub fn list_accounts(&self) -> Result<Vec<AccountRecord>, AccountError> {
        let mut accounts = self.store.list_current()?;
        accounts.retain(|account| self.can_see(account));
        Ok(accounts)
    }

    /// Every version of `id` this node holds, oldest first.
    pub fn account_history(&self, id: &AccountId) -> Result<Vec<StoredVersion>, AccountError> {
        Ok(self.store.history(id)?)
    }

    fn can_see(&self, account: &AccountRecord) -> bool {
        self.party().is_regulator() || account.supplier().key == self.party().key
    }

    fn load_current(&self, id: &AccountId) -> Result<AccountRecord, AccountError> {
        self.store
            .current(id)?
            .ok_or_else(|| AccountError::NotFound(id.clone()))
    }

    // only the supplier of record proposes changes to an account
    fn ensure_supplier(&self, account: &AccountRecord) -> Result<(), AccountError> {
        if account.supplier().key != self.party().key {
            return Err(AccountError::Authorization(format!(
                "{} is not the supplier of account {}",
                self.party(),
                account.id()
            )));
        }
        Ok(())
    }

    async fn propose(&self, transition: Transition) -> Result<SignedTransition, AccountError> {
        let stx = SignedTransition::new(transition)?.sign(&self.identity);
        tracing::info!(
            party = %self.party(),
            tx_id = %stx.id,
            command = ?stx.transition.command,
            "proposing transition"
        );

        let stx = run_initiator(&self.identity, self.store.as_ref(), &self.network, stx).await?;
        tracing::info!(party = %self.party(), tx_id = %stx.id, "transition finalised");
        Ok(stx)
    }
}

fn produced(stx: SignedTransition) -> Result<AccountRecord, AccountError> {
    stx.transition
        .outputs
        .into_iter()
        .next()
        .ok_or_else(|| AccountError::Internal(anyhow::anyhow!("transition {} produced no version", stx.id)))
}
