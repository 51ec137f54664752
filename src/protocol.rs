//! Agreement protocol: collects the counter-signatures a transition declares and
//! finalises it at every party.
//!
//! Both sides are explicit state machines. `step` is a pure function of the
//! current state and one input, returning the next state and the actions the
//! driver must perform (send a message, write the store). The async drivers at
//! the bottom of this module own the sessions and the store and feed every
//! received message back into `step`.
//!
//! ```text
//! BUILDING -> LOCAL_VALIDATE -> COLLECTING_SIGNATURES -> FINALIZING -> DONE
//!     \              \                   \                   \
//!      +--------------+-------------------+-------------------+--> FAILED
//! ```
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::account::AccountRecord;
use crate::contract::{Command, Transition};
use crate::error::{AccountError, SessionError, ValidationError};
use crate::network::{IncomingSession, Network, Session};
use crate::party::{Identity, Party, PublicKey};
use crate::store::RecordStore;
use crate::transaction::{SignedTransition, TransactionSignature};

/// How far a proposal's timestamp may sit from the responder's clock.
pub const PROPOSAL_CLOCK_SKEW_SECS: i64 = 300;

/// Messages exchanged over a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// Initiator asks the counterparty to check and counter-sign.
    Propose(SignedTransition),
    /// Counterparty's signature over the transition id.
    Signed(TransactionSignature),
    Reject(Rejection),
    /// Fully signed transition to record.
    Finalize(SignedTransition),
    /// Counterparty has recorded the finalised transition.
    Recorded,
    /// Initiator gave up; the counterparty discards what it signed.
    Abort(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The counterparty's own run of the ledger rules failed.
    Invalid(ValidationError),
    /// The counterparty refuses to authorise the transition.
    Declined(String),
}

/// Why a protocol instance ended in `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolFailure {
    Validation(ValidationError),
    Authorization(String),
    Transport(String),
}

impl From<ProtocolFailure> for AccountError {
    fn from(value: ProtocolFailure) -> Self {
        match value {
            ProtocolFailure::Validation(e) => AccountError::Validation(e),
            ProtocolFailure::Authorization(reason) => AccountError::Authorization(reason),
            ProtocolFailure::Transport(reason) => AccountError::Transport(reason),
        }
    }
}

impl From<Rejection> for ProtocolFailure {
    fn from(value: Rejection) -> Self {
        match value {
            Rejection::Invalid(e) => ProtocolFailure::Validation(e),
            Rejection::Declined(reason) => ProtocolFailure::Authorization(reason),
        }
    }
}

/// What one party writes to its own store for a finalised transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording<'a> {
    pub consumed: Option<&'a AccountRecord>,
    pub produced: Option<&'a AccountRecord>,
}

impl Recording<'_> {
    pub fn is_empty(&self) -> bool {
        self.consumed.is_none() && self.produced.is_none()
    }
}

/// Per-party visibility of a finalised transition.
///
/// The regulator records every produced version for audit. A supplier records
/// the produced version only when it is a participant of it, so a supplier
/// losing an account on transfer keeps its consumed version and nothing newer.
/// The input is consumed wherever it is the party's current version.
pub fn visible_changes<'a>(
    me: &Party,
    local_current: Option<&AccountRecord>,
    transition: &'a Transition,
) -> Recording<'a> {
    let consumed = transition
        .input()
        .filter(|input| local_current == Some(*input));
    let produced = transition.output().filter(|output| {
        me.is_regulator() || output.participants().iter().any(|party| party.key == me.key)
    });

    Recording { consumed, produced }
}

/// Side effects requested by the initiator state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorAction {
    Send(PublicKey, ProtocolMessage),
    /// Write the finalised transition to the initiator's own store.
    Record(SignedTransition),
    /// Tell these counterparties to discard the transition.
    Abort(Vec<PublicKey>, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorInput {
    /// The proposed transition, already signed by the initiator.
    Built(SignedTransition),
    /// Run the ledger rules locally.
    Validate,
    Message(PublicKey, ProtocolMessage),
    /// No session could be opened with this counterparty.
    Unreachable(PublicKey, String),
    /// An open session failed.
    SessionFailed(PublicKey, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorState {
    Building {
        me: PublicKey,
    },
    LocalValidate {
        me: PublicKey,
        stx: SignedTransition,
    },
    CollectingSignatures {
        stx: SignedTransition,
        counterparties: BTreeSet<PublicKey>,
        pending: BTreeSet<PublicKey>,
    },
    Finalizing {
        stx: SignedTransition,
        awaiting: BTreeSet<PublicKey>,
    },
    Done {
        stx: SignedTransition,
    },
    Failed(ProtocolFailure),
}

impl InitiatorState {
    pub fn new(me: PublicKey) -> Self {
        InitiatorState::Building { me }
    }

    /// The counterparty whose next message the initiator is waiting for.
    pub fn awaiting(&self) -> Option<&PublicKey> {
        match self {
            InitiatorState::CollectingSignatures { pending, .. } => pending.first(),
            InitiatorState::Finalizing { awaiting, .. } => awaiting.first(),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InitiatorState::Done { .. } | InitiatorState::Failed(_))
    }

    pub fn step(self, input: InitiatorInput) -> (InitiatorState, Vec<InitiatorAction>) {
        use InitiatorInput as In;
        use InitiatorState as S;

        match (self, input) {
            (S::Building { me }, In::Built(stx)) => (S::LocalValidate { me, stx }, vec![]),

            (S::LocalValidate { me, stx }, In::Validate) => {
                if let Err(e) = stx.transition.verify() {
                    return (S::Failed(ProtocolFailure::Validation(e)), vec![]);
                }
                if let Err(e) = stx.verify_signatures() {
                    return (S::Failed(ProtocolFailure::Authorization(e.to_string())), vec![]);
                }
                if !stx.signed_keys().contains(&me) {
                    return (
                        S::Failed(ProtocolFailure::Authorization(
                            "initiator has not signed the transition".into(),
                        )),
                        vec![],
                    );
                }

                let counterparties: BTreeSet<PublicKey> = stx
                    .transition
                    .signer_keys()
                    .into_iter()
                    .filter(|key| *key != me)
                    .collect();
                if counterparties.is_empty() {
                    return finalize(stx, counterparties);
                }

                let actions = counterparties
                    .iter()
                    .map(|key| InitiatorAction::Send(*key, ProtocolMessage::Propose(stx.clone())))
                    .collect();
                let pending = counterparties.clone();
                (
                    S::CollectingSignatures {
                        stx,
                        counterparties,
                        pending,
                    },
                    actions,
                )
            }

            (
                S::CollectingSignatures {
                    stx,
                    counterparties,
                    mut pending,
                },
                In::Message(from, ProtocolMessage::Signed(signature)),
            ) if pending.contains(&from) => {
                if signature.by != from || !from.verify(stx.id.as_bytes(), &signature.signature) {
                    let reason = format!("invalid counter-signature from {from}");
                    return fail(ProtocolFailure::Authorization(reason), &counterparties);
                }

                pending.remove(&from);
                let stx = stx.with_signature(signature);
                if pending.is_empty() {
                    finalize(stx, counterparties)
                } else {
                    (
                        S::CollectingSignatures {
                            stx,
                            counterparties,
                            pending,
                        },
                        vec![],
                    )
                }
            }

            (S::CollectingSignatures { counterparties, .. }, In::Message(_, ProtocolMessage::Reject(rejection))) => {
                fail(rejection.into(), &counterparties)
            }
            (S::CollectingSignatures { counterparties, .. }, In::Unreachable(_, reason)) => {
                fail(ProtocolFailure::Authorization(reason), &counterparties)
            }
            (S::CollectingSignatures { counterparties, .. }, In::SessionFailed(_, reason)) => {
                fail(ProtocolFailure::Transport(reason), &counterparties)
            }

            (S::Finalizing { stx, mut awaiting }, In::Message(from, ProtocolMessage::Recorded))
                if awaiting.contains(&from) =>
            {
                awaiting.remove(&from);
                if awaiting.is_empty() {
                    (S::Done { stx }, vec![])
                } else {
                    (S::Finalizing { stx, awaiting }, vec![])
                }
            }
            (S::Finalizing { .. }, In::Message(_, ProtocolMessage::Reject(rejection))) => {
                (S::Failed(rejection.into()), vec![])
            }
            (S::Finalizing { .. }, In::Unreachable(_, reason) | In::SessionFailed(_, reason)) => {
                (S::Failed(ProtocolFailure::Transport(reason)), vec![])
            }

            (state @ (S::Done { .. } | S::Failed(_)), _) => (state, vec![]),

            (state, input) => {
                let reason = format!("unexpected {input:?} while {}", state.stage());
                let counterparties = match &state {
                    S::CollectingSignatures { counterparties, .. } => counterparties.clone(),
                    _ => BTreeSet::new(),
                };
                fail(ProtocolFailure::Transport(reason), &counterparties)
            }
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            InitiatorState::Building { .. } => "BUILDING",
            InitiatorState::LocalValidate { .. } => "LOCAL_VALIDATE",
            InitiatorState::CollectingSignatures { .. } => "COLLECTING_SIGNATURES",
            InitiatorState::Finalizing { .. } => "FINALIZING",
            InitiatorState::Done { .. } => "DONE",
            InitiatorState::Failed(_) => "FAILED",
        }
    }
}

// every signature is in: record locally, then push to every counterparty
fn finalize(
    stx: SignedTransition,
    counterparties: BTreeSet<PublicKey>,
) -> (InitiatorState, Vec<InitiatorAction>) {
    if let Err(e) = stx.verify_complete() {
        return fail(ProtocolFailure::Authorization(e.to_string()), &counterparties);
    }

    let mut actions = vec![InitiatorAction::Record(stx.clone())];
    actions.extend(
        counterparties
            .iter()
            .map(|key| InitiatorAction::Send(*key, ProtocolMessage::Finalize(stx.clone()))),
    );

    if counterparties.is_empty() {
        (InitiatorState::Done { stx }, actions)
    } else {
        (
            InitiatorState::Finalizing {
                stx,
                awaiting: counterparties,
            },
            actions,
        )
    }
}

fn fail(
    failure: ProtocolFailure,
    counterparties: &BTreeSet<PublicKey>,
) -> (InitiatorState, Vec<InitiatorAction>) {
    let reason = format!("{failure:?}");
    let actions = if counterparties.is_empty() {
        vec![]
    } else {
        vec![InitiatorAction::Abort(
            counterparties.iter().copied().collect(),
            reason,
        )]
    };
    (InitiatorState::Failed(failure), actions)
}

/// What a counterparty needs to decide on a proposal.
#[derive(Debug, Clone, Copy)]
pub struct ResponderView<'a> {
    pub identity: &'a Identity,
    /// The responder's current version for the transition's account id.
    pub local_current: Option<&'a AccountRecord>,
    pub accept_transfers: bool,
    /// The responder's own clock, checked against `proposed_at`.
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderAction {
    Reply(ProtocolMessage),
    Record(SignedTransition),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderState {
    AwaitingProposal { initiator: PublicKey },
    AwaitingFinality { stx: SignedTransition },
    Done { stx: SignedTransition },
    Failed(String),
}

impl ResponderState {
    pub fn new(initiator: PublicKey) -> Self {
        ResponderState::AwaitingProposal { initiator }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponderState::Done { .. } | ResponderState::Failed(_))
    }

    pub fn step(
        self,
        message: ProtocolMessage,
        view: ResponderView<'_>,
    ) -> (ResponderState, Vec<ResponderAction>) {
        use ResponderState as S;

        match (self, message) {
            (S::AwaitingProposal { initiator }, ProtocolMessage::Propose(stx)) => {
                match check_proposal(&stx, initiator, view) {
                    Ok(()) => {
                        let signature = stx.signature_for(view.identity);
                        (
                            S::AwaitingFinality { stx },
                            vec![ResponderAction::Reply(ProtocolMessage::Signed(signature))],
                        )
                    }
                    Err(rejection) => (
                        S::Failed(format!("{rejection:?}")),
                        vec![ResponderAction::Reply(ProtocolMessage::Reject(rejection))],
                    ),
                }
            }

            (S::AwaitingFinality { stx }, ProtocolMessage::Finalize(finalized)) => {
                let complete = finalized.verify_complete();
                if finalized.id != stx.id || finalized.transition != stx.transition {
                    let reason = "finalised transition differs from the one signed".to_string();
                    return reject(reason);
                }
                if let Err(e) = complete {
                    return reject(e.to_string());
                }
                (
                    S::Done {
                        stx: finalized.clone(),
                    },
                    vec![
                        ResponderAction::Record(finalized),
                        ResponderAction::Reply(ProtocolMessage::Recorded),
                    ],
                )
            }

            // the signature handed out is simply never used
            (_, ProtocolMessage::Abort(reason)) => (S::Failed(reason), vec![]),

            (state @ (S::Done { .. } | S::Failed(_)), _) => (state, vec![]),

            (_, message) => (S::Failed(format!("unexpected {message:?}")), vec![]),
        }
    }
}

fn reject(reason: String) -> (ResponderState, Vec<ResponderAction>) {
    (
        ResponderState::Failed(reason.clone()),
        vec![ResponderAction::Reply(ProtocolMessage::Reject(
            Rejection::Declined(reason),
        ))],
    )
}

fn check_proposal(
    stx: &SignedTransition,
    initiator: PublicKey,
    view: ResponderView<'_>,
) -> Result<(), Rejection> {
    let me = view.identity.party();
    let transition = &stx.transition;

    stx.verify_signatures()
        .map_err(|e| Rejection::Declined(e.to_string()))?;
    if !stx.signed_keys().contains(&initiator) {
        return Err(Rejection::Declined(
            "the initiator has not signed the transition".into(),
        ));
    }
    if !transition.signer_keys().contains(&me.key) {
        return Err(Rejection::Declined(format!(
            "{me} is not a required signer"
        )));
    }

    // the age rule runs against proposed_at, so it must be close to our clock
    let skew = view.now - transition.proposed_at.to_datetime_utc();
    if skew.num_seconds().abs() > PROPOSAL_CLOCK_SKEW_SECS {
        return Err(Rejection::Declined(format!(
            "proposal timestamp {} is too far from now",
            transition.proposed_at.to_datetime_utc()
        )));
    }

    transition.verify().map_err(Rejection::Invalid)?;

    // a responder that holds the account must agree on its current version
    if let Some(local) = view.local_current {
        if transition.input() != Some(local) {
            return Err(Rejection::Declined(format!(
                "proposal does not consume the current version of {}",
                local.id()
            )));
        }
    }

    let incoming_transfer = transition.command == Command::Transfer
        && transition
            .output()
            .is_some_and(|output| output.supplier().key == me.key);
    if incoming_transfer && !view.accept_transfers {
        return Err(Rejection::Declined(format!(
            "{me} does not accept account transfers"
        )));
    }

    Ok(())
}

/// The account version a transition is about.
fn subject(transition: &Transition) -> Option<&AccountRecord> {
    transition.input().or(transition.output())
}

fn record_visible(
    me: &Party,
    store: &dyn RecordStore,
    stx: &SignedTransition,
) -> Result<(), AccountError> {
    let Some(account) = subject(&stx.transition) else {
        return Ok(());
    };
    let local_current = store.current(account.id())?;
    let recording = visible_changes(me, local_current.as_ref(), &stx.transition);

    if recording.is_empty() {
        tracing::debug!(party = %me, tx_id = %stx.id, "nothing visible to record");
        return Ok(());
    }
    store.record(&stx.id, recording.consumed, recording.produced)?;
    Ok(())
}

/// Drives the initiator side from `LOCAL_VALIDATE` to a terminal state.
///
/// `stx` must already carry the initiator's signature. Nothing is written to
/// any store unless every declared signer has signed.
pub async fn run_initiator(
    identity: &Identity,
    store: &dyn RecordStore,
    network: &Network,
    stx: SignedTransition,
) -> Result<SignedTransition, AccountError> {
    let me = identity.party();
    let tx_id = stx.id.clone();
    let command = stx.transition.command;
    let parties: BTreeMap<PublicKey, Party> = stx
        .transition
        .signers
        .iter()
        .map(|party| (party.key, party.clone()))
        .collect();

    let mut sessions: BTreeMap<PublicKey, Session> = BTreeMap::new();
    let mut state = InitiatorState::new(me.key);
    let mut inputs = VecDeque::from([InitiatorInput::Built(stx), InitiatorInput::Validate]);

    loop {
        while let Some(input) = inputs.pop_front() {
            let stage = state.stage();
            let (next, actions) = state.step(input);
            if next.stage() != stage {
                tracing::info!(tx_id = %tx_id, ?command, from = stage, to = next.stage(), "initiator stage");
            }
            state = next;

            for action in actions {
                match action {
                    InitiatorAction::Send(key, message) => {
                        if let Err(failure) =
                            send_to(me, network, &parties, &mut sessions, key, message).await
                        {
                            inputs.push_back(failure);
                        }
                    }
                    InitiatorAction::Record(stx) => record_visible(me, store, &stx)?,
                    InitiatorAction::Abort(keys, reason) => {
                        for key in keys {
                            if let Some(session) = sessions.get(&key) {
                                // the counterparty may already be gone
                                let _ = session.send(ProtocolMessage::Abort(reason.clone())).await;
                            }
                        }
                    }
                }
            }
        }

        match &state {
            InitiatorState::Done { stx } => return Ok(stx.clone()),
            InitiatorState::Failed(failure) => {
                tracing::warn!(tx_id = %tx_id, ?command, ?failure, "transition failed");
                return Err(failure.clone().into());
            }
            _ => {}
        }

        let Some(key) = state.awaiting().copied() else {
            let reason = format!("nothing to wait for while {}", state.stage());
            return Err(AccountError::Transport(reason));
        };
        let input = match sessions.get_mut(&key) {
            Some(session) => match session.receive().await {
                Ok(message) => InitiatorInput::Message(key, message),
                Err(e) => InitiatorInput::SessionFailed(key, e.to_string()),
            },
            None => InitiatorInput::SessionFailed(key, format!("no open session with {key}")),
        };
        inputs.push_back(input);
    }
}

// opens the session on first use
async fn send_to(
    me: &Party,
    network: &Network,
    parties: &BTreeMap<PublicKey, Party>,
    sessions: &mut BTreeMap<PublicKey, Session>,
    key: PublicKey,
    message: ProtocolMessage,
) -> Result<(), InitiatorInput> {
    if !sessions.contains_key(&key) {
        let Some(party) = parties.get(&key) else {
            return Err(InitiatorInput::Unreachable(key, format!("unknown party {key}")));
        };
        match network.open_session(me, party).await {
            Ok(session) => {
                sessions.insert(key, session);
            }
            Err(e) => return Err(InitiatorInput::Unreachable(key, e.to_string())),
        }
    }

    let Some(session) = sessions.get(&key) else {
        return Err(InitiatorInput::Unreachable(key, format!("no session with {key}")));
    };
    session.send(message).await.map_err(|e| match e {
        SessionError::Unreachable(reason) => InitiatorInput::Unreachable(key, reason),
        SessionError::Closed(_) => InitiatorInput::SessionFailed(key, e.to_string()),
    })
}

/// Drives the counterparty side of one session until it terminates.
pub async fn run_responder(
    identity: &Identity,
    store: &dyn RecordStore,
    accept_transfers: bool,
    incoming: IncomingSession,
) -> Result<Option<SignedTransition>, AccountError> {
    let me = identity.party();
    let mut session = incoming.session;
    let mut state = ResponderState::new(session.counterparty().key);

    while !state.is_terminal() {
        let message = session
            .receive()
            .await
            .map_err(|e| AccountError::Transport(e.to_string()))?;

        let local_current = match &message {
            ProtocolMessage::Propose(stx) => match subject(&stx.transition) {
                Some(account) => store.current(account.id())?,
                None => None,
            },
            _ => None,
        };
        let view = ResponderView {
            identity,
            local_current: local_current.as_ref(),
            accept_transfers,
            now: Utc::now(),
        };

        let (next, actions) = state.step(message, view);
        state = next;

        for action in actions {
            match action {
                ResponderAction::Reply(message) => {
                    if let ProtocolMessage::Reject(rejection) = &message {
                        tracing::warn!(party = %me, ?rejection, "rejecting proposal");
                    }
                    session
                        .send(message)
                        .await
                        .map_err(|e| AccountError::Transport(e.to_string()))?;
                }
                ResponderAction::Record(stx) => record_visible(me, store, &stx)?,
            }
        }
    }

    match state {
        ResponderState::Done { stx } => {
            tracing::info!(party = %me, tx_id = %stx.id, command = ?stx.transition.command, "recorded counter-signed transition");
            Ok(Some(stx))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{BirthDate, CustomerDetails};
    use crate::party::Role;

    struct Parties {
        regulator: Identity,
        supplier: Identity,
        other: Identity,
    }

    fn parties() -> Parties {
        Parties {
            regulator: Identity::generate("Government Regulator", Role::Regulator),
            supplier: Identity::generate("British Energy", Role::Supplier),
            other: Identity::generate("UK Power", Role::Supplier),
        }
    }

    fn customer() -> CustomerDetails {
        CustomerDetails::new(
            "Alice",
            "Anderson",
            BirthDate::new(1980, 1, 1).unwrap(),
            "1 London Wall",
        )
    }

    fn proposed_create(p: &Parties) -> SignedTransition {
        let transition = Transition::create(
            p.regulator.party().clone(),
            p.supplier.party().clone(),
            customer(),
        )
        .unwrap();
        SignedTransition::new(transition).unwrap().sign(&p.supplier)
    }

    fn view<'a>(identity: &'a Identity, local: Option<&'a AccountRecord>) -> ResponderView<'a> {
        ResponderView {
            identity,
            local_current: local,
            accept_transfers: true,
            now: Utc::now(),
        }
    }

    #[test]
    fn happy_path_walks_every_stage() {
        let p = parties();
        let stx = proposed_create(&p);
        let regulator = p.regulator.key();

        let (state, actions) = InitiatorState::new(p.supplier.key()).step(InitiatorInput::Built(stx.clone()));
        assert_eq!(state.stage(), "LOCAL_VALIDATE");
        assert!(actions.is_empty());

        let (state, actions) = state.step(InitiatorInput::Validate);
        assert_eq!(state.stage(), "COLLECTING_SIGNATURES");
        assert_eq!(
            actions,
            vec![InitiatorAction::Send(regulator, ProtocolMessage::Propose(stx.clone()))]
        );

        let (responder, replies) = ResponderState::new(p.supplier.key())
            .step(ProtocolMessage::Propose(stx.clone()), view(&p.regulator, None));
        let [ResponderAction::Reply(signed)] = replies.as_slice() else {
            panic!("expected a single reply, got {replies:?}");
        };

        let (state, actions) = state.step(InitiatorInput::Message(regulator, signed.clone()));
        assert_eq!(state.stage(), "FINALIZING");
        let InitiatorAction::Record(finalized) = &actions[0] else {
            panic!("expected a local record first, got {actions:?}");
        };
        assert!(finalized.verify_complete().is_ok());

        let (responder, actions) =
            responder.step(ProtocolMessage::Finalize(finalized.clone()), view(&p.regulator, None));
        assert!(matches!(responder, ResponderState::Done { .. }));
        assert_eq!(actions.last(), Some(&ResponderAction::Reply(ProtocolMessage::Recorded)));

        let (state, _) = state.step(InitiatorInput::Message(regulator, ProtocolMessage::Recorded));
        assert_eq!(state.stage(), "DONE");
    }

    #[test]
    fn local_validation_failure_sends_nothing() {
        let p = parties();
        let bad = CustomerDetails::new("", "Anderson", BirthDate::new(1980, 1, 1).unwrap(), "1 London Wall");
        let transition =
            Transition::create(p.regulator.party().clone(), p.supplier.party().clone(), bad).unwrap();
        let stx = SignedTransition::new(transition).unwrap().sign(&p.supplier);

        let (state, _) = InitiatorState::new(p.supplier.key()).step(InitiatorInput::Built(stx));
        let (state, actions) = state.step(InitiatorInput::Validate);

        assert_eq!(
            state,
            InitiatorState::Failed(ProtocolFailure::Validation(ValidationError::NameMissing))
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn rejection_aborts_every_counterparty() {
        let p = parties();
        let account = proposed_create(&p).transition.outputs[0].clone();
        let transition = Transition::transfer(&account, p.other.party().clone());
        let stx = SignedTransition::new(transition).unwrap().sign(&p.supplier);

        let (state, _) = InitiatorState::new(p.supplier.key()).step(InitiatorInput::Built(stx));
        let (state, _) = state.step(InitiatorInput::Validate);
        let declined = ProtocolMessage::Reject(Rejection::Declined("no thanks".into()));
        let (state, actions) = state.step(InitiatorInput::Message(p.other.key(), declined));

        assert_eq!(
            state,
            InitiatorState::Failed(ProtocolFailure::Authorization("no thanks".into()))
        );
        let [InitiatorAction::Abort(keys, _)] = actions.as_slice() else {
            panic!("expected an abort, got {actions:?}");
        };
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn responder_refuses_when_not_a_signer() {
        let p = parties();
        let stx = proposed_create(&p);

        let (state, actions) =
            ResponderState::new(p.supplier.key()).step(ProtocolMessage::Propose(stx), view(&p.other, None));

        assert!(matches!(state, ResponderState::Failed(_)));
        assert!(matches!(
            actions.as_slice(),
            [ResponderAction::Reply(ProtocolMessage::Reject(Rejection::Declined(_)))]
        ));
    }

    #[test]
    fn responder_refuses_stale_input() {
        let p = parties();
        let account = proposed_create(&p).transition.outputs[0].clone();
        let newer = account.with_new_reading(10, None);
        let transition = Transition::meter_read(&account, 5, None);
        let stx = SignedTransition::new(transition).unwrap().sign(&p.supplier);

        let (_, actions) = ResponderState::new(p.supplier.key())
            .step(ProtocolMessage::Propose(stx), view(&p.regulator, Some(&newer)));

        assert!(matches!(
            actions.as_slice(),
            [ResponderAction::Reply(ProtocolMessage::Reject(Rejection::Declined(_)))]
        ));
    }

    #[test]
    fn responder_refuses_backdated_proposal() {
        let p = parties();
        let mut transition = proposed_create(&p).transition;
        transition.proposed_at = crate::account::TimeStamp::new_with(2020, 1, 1, 0, 0, 0);
        let stx = SignedTransition::new(transition).unwrap().sign(&p.supplier);

        let (state, actions) = ResponderState::new(p.supplier.key())
            .step(ProtocolMessage::Propose(stx), view(&p.regulator, None));

        assert!(matches!(state, ResponderState::Failed(_)));
        assert!(matches!(
            actions.as_slice(),
            [ResponderAction::Reply(ProtocolMessage::Reject(Rejection::Declined(_)))]
        ));
    }

    #[test]
    fn failure_while_finalizing_keeps_local_record() {
        let p = parties();
        let stx = proposed_create(&p);
        let regulator = p.regulator.key();

        let (state, _) = InitiatorState::new(p.supplier.key()).step(InitiatorInput::Built(stx.clone()));
        let (state, _) = state.step(InitiatorInput::Validate);
        let signature = stx.signature_for(&p.regulator);
        let (state, actions) = state.step(InitiatorInput::Message(
            regulator,
            ProtocolMessage::Signed(signature),
        ));
        assert_eq!(state.stage(), "FINALIZING");
        assert!(matches!(actions.first(), Some(InitiatorAction::Record(_))));

        let (state, actions) =
            state.step(InitiatorInput::SessionFailed(regulator, "connection reset".into()));

        assert_eq!(
            state,
            InitiatorState::Failed(ProtocolFailure::Transport("connection reset".into()))
        );
        // already recorded locally, so there is nothing left to abort
        assert!(actions.is_empty());
    }

    #[test]
    fn abort_after_signing_records_nothing() {
        let p = parties();
        let stx = proposed_create(&p);

        let (state, replies) = ResponderState::new(p.supplier.key())
            .step(ProtocolMessage::Propose(stx), view(&p.regulator, None));
        assert!(matches!(state, ResponderState::AwaitingFinality { .. }));
        assert!(matches!(
            replies.as_slice(),
            [ResponderAction::Reply(ProtocolMessage::Signed(_))]
        ));

        let (state, actions) = state.step(
            ProtocolMessage::Abort("counterparty declined".into()),
            view(&p.regulator, None),
        );

        assert_eq!(state, ResponderState::Failed("counterparty declined".into()));
        assert!(actions.is_empty());
    }

    #[test]
    fn visibility_follows_participation() {
        let p = parties();
        let account = proposed_create(&p).transition.outputs[0].clone();
        let transfer = Transition::transfer(&account, p.other.party().clone());

        let old_supplier = visible_changes(p.supplier.party(), Some(&account), &transfer);
        assert_eq!(old_supplier.consumed, Some(&account));
        assert_eq!(old_supplier.produced, None);

        let new_supplier = visible_changes(p.other.party(), None, &transfer);
        assert_eq!(new_supplier.consumed, None);
        assert_eq!(new_supplier.produced, transfer.output());

        let regulator = visible_changes(p.regulator.party(), Some(&account), &transfer);
        assert_eq!(regulator.consumed, Some(&account));
        assert_eq!(regulator.produced, transfer.output());
    }
}
