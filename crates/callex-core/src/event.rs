//! Audit event model and factory.
//!
//! An [`AuditEvent`] is the ledger's only first-class record. Producers build
//! one through [`AuditEvent::new`], which validates the fields; the ledger
//! later assigns the sequence number and seals the event by computing its
//! hash. After sealing, only `archived` may change.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::LedgerError;
use crate::hash;

/// Maximum length of actor ids, target ids and actions.
pub const MAX_FIELD_LEN: usize = 255;

/// Maximum length of a metadata key or compliance flag name.
pub const MAX_KEY_LEN: usize = 128;

/// Well-known compliance flag names.
pub mod compliance {
    /// Event concerns personal data under GDPR.
    pub const GDPR_RELEVANT: &str = "gdpr_relevant";
    /// Event concerns telephone consumer protection (consent, DNC).
    pub const TCPA_RELEVANT: &str = "tcpa_relevant";
    /// Event concerns California consumer privacy rights.
    pub const CCPA_RELEVANT: &str = "ccpa_relevant";

    /// All well-known flags, in reporting order.
    pub const ALL: [&str; 3] = [GDPR_RELEVANT, TCPA_RELEVANT, CCPA_RELEVANT];
}

fn parse_known<T: Copy>(all: &[T], s: &str, name: impl Fn(T) -> &'static str, kind: &str) -> Result<T, LedgerError> {
    all.iter()
        .copied()
        .find(|candidate| name(*candidate) == s)
        .ok_or_else(|| LedgerError::validation(format!("unrecognized {kind}: {s:?}")))
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// An inbound call reached the exchange.
    #[serde(rename = "call.initiated")]
    CallInitiated,
    /// A call was routed to a buyer.
    #[serde(rename = "call.routed")]
    CallRouted,
    /// A routed call was answered.
    #[serde(rename = "call.answered")]
    CallAnswered,
    /// A call ended normally.
    #[serde(rename = "call.completed")]
    CallCompleted,
    /// A call could not be connected or dropped abnormally.
    #[serde(rename = "call.failed")]
    CallFailed,
    /// A call was transferred to another destination.
    #[serde(rename = "call.transferred")]
    CallTransferred,
    /// A buyer placed a bid on a call.
    #[serde(rename = "bid.placed")]
    BidPlaced,
    /// A bid won the auction.
    #[serde(rename = "bid.won")]
    BidWon,
    /// A bid lost the auction.
    #[serde(rename = "bid.lost")]
    BidLost,
    /// A bid was withdrawn before the auction closed.
    #[serde(rename = "bid.cancelled")]
    BidCancelled,
    /// A consumer granted consent to be contacted.
    #[serde(rename = "consent.granted")]
    ConsentGranted,
    /// A consumer revoked consent.
    #[serde(rename = "consent.revoked")]
    ConsentRevoked,
    /// The scope of an existing consent changed.
    #[serde(rename = "consent.updated")]
    ConsentUpdated,
    /// A number was checked against the do-not-call list.
    #[serde(rename = "dnc.checked")]
    DncChecked,
    /// Fraud screening flagged an actor or call.
    #[serde(rename = "fraud.detected")]
    FraudDetected,
    /// A successful sign-in.
    #[serde(rename = "auth.login")]
    AuthLogin,
    /// A sign-out.
    #[serde(rename = "auth.logout")]
    AuthLogout,
    /// A rejected sign-in attempt.
    #[serde(rename = "auth.failed")]
    AuthFailed,
    /// Personal data was read.
    #[serde(rename = "data.accessed")]
    DataAccessed,
    /// Personal data left the system.
    #[serde(rename = "data.exported")]
    DataExported,
    /// Personal data was erased on request.
    #[serde(rename = "data.deleted")]
    DataDeleted,
    /// A marketplace account was opened.
    #[serde(rename = "account.created")]
    AccountCreated,
    /// A marketplace account changed.
    #[serde(rename = "account.updated")]
    AccountUpdated,
    /// Platform configuration changed.
    #[serde(rename = "config.changed")]
    ConfigChanged,
}

impl EventType {
    /// Every event type.
    pub const ALL: [Self; 24] = [
        Self::CallInitiated,
        Self::CallRouted,
        Self::CallAnswered,
        Self::CallCompleted,
        Self::CallFailed,
        Self::CallTransferred,
        Self::BidPlaced,
        Self::BidWon,
        Self::BidLost,
        Self::BidCancelled,
        Self::ConsentGranted,
        Self::ConsentRevoked,
        Self::ConsentUpdated,
        Self::DncChecked,
        Self::FraudDetected,
        Self::AuthLogin,
        Self::AuthLogout,
        Self::AuthFailed,
        Self::DataAccessed,
        Self::DataExported,
        Self::DataDeleted,
        Self::AccountCreated,
        Self::AccountUpdated,
        Self::ConfigChanged,
    ];

    /// Stable string form, also used as the stored column value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CallInitiated => "call.initiated",
            Self::CallRouted => "call.routed",
            Self::CallAnswered => "call.answered",
            Self::CallCompleted => "call.completed",
            Self::CallFailed => "call.failed",
            Self::CallTransferred => "call.transferred",
            Self::BidPlaced => "bid.placed",
            Self::BidWon => "bid.won",
            Self::BidLost => "bid.lost",
            Self::BidCancelled => "bid.cancelled",
            Self::ConsentGranted => "consent.granted",
            Self::ConsentRevoked => "consent.revoked",
            Self::ConsentUpdated => "consent.updated",
            Self::DncChecked => "dnc.checked",
            Self::FraudDetected => "fraud.detected",
            Self::AuthLogin => "auth.login",
            Self::AuthLogout => "auth.logout",
            Self::AuthFailed => "auth.failed",
            Self::DataAccessed => "data.accessed",
            Self::DataExported => "data.exported",
            Self::DataDeleted => "data.deleted",
            Self::AccountCreated => "account.created",
            Self::AccountUpdated => "account.updated",
            Self::ConfigChanged => "config.changed",
        }
    }

    /// Severity assigned by the factory unless overridden.
    #[must_use]
    pub fn default_severity(self) -> Severity {
        match self {
            Self::FraudDetected | Self::DataDeleted => Severity::Critical,
            Self::CallFailed => Severity::Error,
            Self::AuthFailed | Self::ConsentRevoked | Self::DataExported | Self::ConfigChanged => {
                Severity::Warning
            }
            _ => Severity::Info,
        }
    }

    /// Target type assigned by the factory unless overridden.
    #[must_use]
    pub fn default_target_type(self) -> TargetType {
        match self {
            Self::CallInitiated
            | Self::CallRouted
            | Self::CallAnswered
            | Self::CallCompleted
            | Self::CallFailed
            | Self::CallTransferred
            | Self::FraudDetected => TargetType::Call,
            Self::BidPlaced | Self::BidWon | Self::BidLost | Self::BidCancelled => TargetType::Bid,
            Self::ConsentGranted | Self::ConsentRevoked | Self::ConsentUpdated => {
                TargetType::Consent
            }
            Self::DncChecked => TargetType::PhoneNumber,
            Self::AuthLogin | Self::AuthLogout | Self::AuthFailed => TargetType::Session,
            Self::DataAccessed | Self::DataExported | Self::DataDeleted => TargetType::PersonalData,
            Self::AccountCreated | Self::AccountUpdated => TargetType::Account,
            Self::ConfigChanged => TargetType::Configuration,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_known(&Self::ALL, s, Self::as_str, "event type")
    }
}

/// How serious the event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine activity.
    Info,
    /// Worth a second look.
    Warning,
    /// A failed operation.
    Error,
    /// Requires immediate attention.
    Critical,
}

impl Severity {
    /// Every severity, lowest first.
    pub const ALL: [Self; 4] = [Self::Info, Self::Warning, Self::Error, Self::Critical];

    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_known(&Self::ALL, s, Self::as_str, "severity")
    }
}

/// Outcome of the recorded action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventResult {
    /// The action completed.
    Success,
    /// The action was attempted and failed.
    Failure,
    /// The action completed in part.
    Partial,
}

impl EventResult {
    /// Every result.
    pub const ALL: [Self; 3] = [Self::Success, Self::Failure, Self::Partial];

    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for EventResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventResult {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_known(&Self::ALL, s, Self::as_str, "result")
    }
}

/// Who performed the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// An interactive platform user.
    User,
    /// A call buyer.
    Buyer,
    /// A call seller (publisher).
    Seller,
    /// A platform operator.
    Admin,
    /// An internal service.
    Service,
    /// The platform itself (schedulers, retention jobs).
    System,
    /// An external API client.
    ApiClient,
}

impl ActorType {
    /// Every actor type.
    pub const ALL: [Self; 7] = [
        Self::User,
        Self::Buyer,
        Self::Seller,
        Self::Admin,
        Self::Service,
        Self::System,
        Self::ApiClient,
    ];

    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Buyer => "buyer",
            Self::Seller => "seller",
            Self::Admin => "admin",
            Self::Service => "service",
            Self::System => "system",
            Self::ApiClient => "api_client",
        }
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_known(&Self::ALL, s, Self::as_str, "actor type")
    }
}

/// What the action was performed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// A phone call.
    Call,
    /// An auction bid.
    Bid,
    /// A consent record.
    Consent,
    /// A phone number.
    PhoneNumber,
    /// An authenticated session.
    Session,
    /// A marketplace account.
    Account,
    /// Personal data held about a consumer.
    PersonalData,
    /// Platform configuration.
    Configuration,
}

impl TargetType {
    /// Every target type.
    pub const ALL: [Self; 8] = [
        Self::Call,
        Self::Bid,
        Self::Consent,
        Self::PhoneNumber,
        Self::Session,
        Self::Account,
        Self::PersonalData,
        Self::Configuration,
    ];

    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Bid => "bid",
            Self::Consent => "consent",
            Self::PhoneNumber => "phone_number",
            Self::Session => "session",
            Self::Account => "account",
            Self::PersonalData => "personal_data",
            Self::Configuration => "configuration",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_known(&Self::ALL, s, Self::as_str, "target type")
    }
}

/// A single metadata value. Open keys, closed value shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Integer(i64),
    /// A finite floating point number.
    Float(f64),
    /// A string.
    Text(String),
    /// A list of values.
    List(Vec<MetadataValue>),
}

/// Floats at or above this magnitude serialize in exponent form and come
/// back from JSONB storage as integers.
pub const MAX_FLOAT_MAGNITUDE: f64 = 1e16;

impl MetadataValue {
    /// True when the value serializes identically after a trip through JSONB.
    ///
    /// Floats must be finite, below [`MAX_FLOAT_MAGNITUDE`] and not negative
    /// zero, which JSONB stores as plain zero.
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        match self {
            Self::Float(value) => {
                value.is_finite()
                    && value.abs() < MAX_FLOAT_MAGNITUDE
                    && value.to_bits() != (-0.0_f64).to_bits()
            }
            Self::List(values) => values.iter().all(Self::is_canonical),
            _ => true,
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Free-form event context, ordered by key so serialization is deterministic.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Regulatory classification of an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComplianceFlags(BTreeMap<String, bool>);

impl ComplianceFlags {
    /// Creates an empty flag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `flag` to `value`.
    pub fn set(&mut self, flag: impl Into<String>, value: bool) {
        self.0.insert(flag.into(), value);
    }

    /// Returns the value of `flag`, if it was recorded.
    #[must_use]
    pub fn get(&self, flag: &str) -> Option<bool> {
        self.0.get(flag).copied()
    }

    /// True when `flag` is recorded and set.
    #[must_use]
    pub fn is_set(&self, flag: &str) -> bool {
        self.get(flag).unwrap_or(false)
    }

    /// True when every entry of `required` is present here with the same value.
    #[must_use]
    pub fn contains(&self, required: &ComplianceFlags) -> bool {
        required
            .0
            .iter()
            .all(|(flag, value)| self.0.get(flag) == Some(value))
    }

    /// Iterates over recorded flags in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(flag, value)| (flag.as_str(), *value))
    }

    /// True when no flag is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, bool)> for ComplianceFlags {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An immutable audit record.
///
/// `sequence_num` and `event_hash` stay `None` until the ledger persists the
/// event. `previous_hash` is meaningful only once `event_hash` is set; the
/// first event in the ledger links to the empty string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Globally unique identifier.
    pub id: Uuid,
    /// Position in the ledger's total order.
    pub sequence_num: Option<u64>,
    /// What happened.
    pub event_type: EventType,
    /// How serious it is.
    pub severity: Severity,
    /// Free-form verb describing the action, e.g. `route_call`.
    pub action: String,
    /// Outcome of the action.
    pub result: EventResult,
    /// Who did it.
    pub actor_id: String,
    /// Kind of actor.
    pub actor_type: ActorType,
    /// What it was done to.
    pub target_id: String,
    /// Kind of target.
    pub target_type: TargetType,
    /// Free-form context.
    pub metadata: Metadata,
    /// Regulatory classification.
    pub compliance_flags: ComplianceFlags,
    /// Creation time, truncated to microseconds.
    pub timestamp: DateTime<Utc>,
    /// Digest over the immutable fields and `previous_hash`.
    pub event_hash: Option<String>,
    /// Digest of the preceding event.
    pub previous_hash: String,
    /// Retention marker; the only field that may change after persistence.
    pub archived: bool,
}

impl AuditEvent {
    /// Creates a validated, not yet persisted event.
    ///
    /// Severity and target type default from `event_type`; the actor defaults
    /// to [`ActorType::User`] and the result to [`EventResult::Success`].
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` if `actor_id`, `target_id` or
    /// `action` is empty or too long.
    pub fn new(
        event_type: EventType,
        actor_id: impl Into<String>,
        target_id: impl Into<String>,
        action: impl Into<String>,
        clock: &dyn Clock,
    ) -> Result<Self, LedgerError> {
        let event = Self {
            id: Uuid::new_v4(),
            sequence_num: None,
            event_type,
            severity: event_type.default_severity(),
            action: action.into(),
            result: EventResult::Success,
            actor_id: actor_id.into(),
            actor_type: ActorType::User,
            target_id: target_id.into(),
            target_type: event_type.default_target_type(),
            metadata: Metadata::new(),
            compliance_flags: ComplianceFlags::new(),
            timestamp: clock.now().trunc_subsecs(6),
            event_hash: None,
            previous_hash: String::new(),
            archived: false,
        };
        event.validate()?;
        Ok(event)
    }

    /// Overrides the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Overrides the result.
    #[must_use]
    pub fn with_result(mut self, result: EventResult) -> Self {
        self.result = result;
        self
    }

    /// Overrides the actor type.
    #[must_use]
    pub fn with_actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    /// Overrides the target type.
    #[must_use]
    pub fn with_target_type(mut self, target_type: TargetType) -> Self {
        self.target_type = target_type;
        self
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets one compliance flag.
    #[must_use]
    pub fn with_compliance_flag(mut self, flag: impl Into<String>, value: bool) -> Self {
        self.compliance_flags.set(flag, value);
        self
    }

    /// True once the event carries a hash.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.event_hash.is_some()
    }

    /// Checks field-level constraints.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` describing the first violation.
    pub fn validate(&self) -> Result<(), LedgerError> {
        check_field("actor_id", &self.actor_id)?;
        check_field("target_id", &self.target_id)?;
        check_field("action", &self.action)?;

        for (key, value) in &self.metadata {
            check_key("metadata key", key)?;
            if !value.is_canonical() {
                return Err(LedgerError::validation(format!(
                    "metadata value for {key:?} must be a finite number below \
                     {MAX_FLOAT_MAGNITUDE:e} in magnitude and not negative zero"
                )));
            }
        }
        for (flag, _) in self.compliance_flags.iter() {
            check_key("compliance flag", flag)?;
        }

        if self.sequence_num == Some(0) {
            return Err(LedgerError::validation("sequence_num must be positive"));
        }
        if self.event_hash.is_some() && self.sequence_num.is_none() {
            return Err(LedgerError::validation(
                "event_hash is set but sequence_num is not",
            ));
        }
        Ok(())
    }

    /// Links the event to `previous_hash` and computes its own hash.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Immutable` if the event is already sealed and
    /// `LedgerError::Validation` if no sequence number has been assigned.
    pub fn seal(&mut self, previous_hash: impl Into<String>) -> Result<(), LedgerError> {
        if self.is_sealed() {
            return Err(LedgerError::Immutable(self.id));
        }
        if self.sequence_num.is_none() {
            return Err(LedgerError::validation(
                "cannot seal an event without a sequence number",
            ));
        }
        self.previous_hash = previous_hash.into();
        self.event_hash = Some(hash::compute_event_hash(self, &self.previous_hash));
        Ok(())
    }
}

fn check_field(name: &str, value: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::validation(format!("{name} must not be empty")));
    }
    if value.chars().count() > MAX_FIELD_LEN {
        return Err(LedgerError::validation(format!(
            "{name} must be at most {MAX_FIELD_LEN} characters"
        )));
    }
    Ok(())
}

fn check_key(name: &str, key: &str) -> Result<(), LedgerError> {
    if key.trim().is_empty() || key.chars().count() > MAX_KEY_LEN {
        return Err(LedgerError::validation(format!(
            "{name} must be 1-{MAX_KEY_LEN} characters"
        )));
    }
    Ok(())
}
