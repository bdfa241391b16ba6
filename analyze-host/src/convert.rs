// Marshalling Module - Conversion between native values and Canonical ABI values
//
// Every type that crosses the component boundary implements `ToVal` and
// `FromVal` by hand. Variants are converted per type because each case carries
// a different payload shape; records go through `record()` and `RecordFields`
// so that native and ABI field names stay in one-to-one correspondence.

use thiserror::Error;
use wasmtime::component::Val;

use crate::abi::{to_abi_name, to_native_name};
use crate::types::*;

/// A value did not have the shape the component world declares
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("expected {expected}, found {found}")]
    UnexpectedShape { expected: &'static str, found: String },

    #[error("record `{record}` is missing field `{field}`")]
    MissingField { record: &'static str, field: String },

    #[error("record `{record}` has unmapped field `{field}`")]
    UnmappedField { record: &'static str, field: String },

    #[error("unknown case `{case}` for `{type_name}`")]
    UnknownCase { type_name: &'static str, case: String },

    #[error("case `{case}` of `{type_name}` {detail}")]
    PayloadMismatch {
        type_name: &'static str,
        case: String,
        detail: &'static str,
    },
}

type Result<T> = std::result::Result<T, MarshalError>;

/// Native value that can be lowered into a Canonical ABI value
pub trait ToVal {
    fn to_val(&self) -> Val;

    /// Payload representation inside a `result` or variant case
    fn to_payload(&self) -> Option<Val> {
        Some(self.to_val())
    }
}

/// Native value that can be lifted from a Canonical ABI value
pub trait FromVal: Sized {
    fn from_val(val: &Val) -> Result<Self>;

    /// Lift from the optional payload of a `result` or variant case
    fn from_payload(payload: Option<&Val>) -> Result<Self> {
        match payload {
            Some(val) => Self::from_val(val),
            None => Err(MarshalError::UnexpectedShape {
                expected: "payload",
                found: "nothing".to_string(),
            }),
        }
    }
}

fn shape(val: &Val) -> String {
    let name = match val {
        Val::Bool(_) => "bool",
        Val::S8(_) | Val::S16(_) | Val::S32(_) | Val::S64(_) => "signed integer",
        Val::U8(_) | Val::U16(_) | Val::U32(_) | Val::U64(_) => "unsigned integer",
        Val::Float32(_) | Val::Float64(_) => "float",
        Val::Char(_) => "char",
        Val::String(_) => "string",
        Val::List(_) => "list",
        Val::Record(_) => "record",
        Val::Tuple(_) => "tuple",
        Val::Variant(case, _) => return format!("variant case `{case}`"),
        Val::Enum(case) => return format!("enum case `{case}`"),
        Val::Option(_) => "option",
        Val::Result(_) => "result",
        Val::Flags(_) => "flags",
        _ => "resource",
    };
    name.to_string()
}

fn unexpected(expected: &'static str, val: &Val) -> MarshalError {
    MarshalError::UnexpectedShape {
        expected,
        found: shape(val),
    }
}

/// Build a record from native field names
pub(crate) fn record<const N: usize>(fields: [(&str, Val); N]) -> Val {
    Val::Record(
        fields
            .into_iter()
            .map(|(name, val)| (to_abi_name(name), val))
            .collect(),
    )
}

/// Read access to a record whose field set has been checked against the
/// native definition
pub(crate) struct RecordFields<'a> {
    record: &'static str,
    fields: &'a [(String, Val)],
}

impl<'a> RecordFields<'a> {
    pub(crate) fn new(record: &'static str, val: &'a Val, expected: &[&str]) -> Result<Self> {
        let fields = match val {
            Val::Record(fields) => fields.as_slice(),
            other => return Err(unexpected("record", other)),
        };

        for (name, _) in fields {
            if !expected.contains(&to_native_name(name).as_str()) {
                return Err(MarshalError::UnmappedField {
                    record,
                    field: name.clone(),
                });
            }
        }
        for native in expected {
            let abi = to_abi_name(native);
            if !fields.iter().any(|(name, _)| *name == abi) {
                return Err(MarshalError::MissingField {
                    record,
                    field: abi,
                });
            }
        }

        Ok(Self { record, fields })
    }

    pub(crate) fn get<T: FromVal>(&self, native: &str) -> Result<T> {
        let abi = to_abi_name(native);
        self.fields
            .iter()
            .find(|(name, _)| *name == abi)
            .ok_or_else(|| MarshalError::MissingField {
                record: self.record,
                field: abi,
            })
            .and_then(|(_, val)| T::from_val(val))
    }
}

fn variant(case: &str, payload: Option<Val>) -> Val {
    Val::Variant(case.to_string(), payload.map(Box::new))
}

fn as_variant<'a>(type_name: &'static str, val: &'a Val) -> Result<(&'a str, Option<&'a Val>)> {
    match val {
        Val::Variant(case, payload) => Ok((case.as_str(), payload.as_deref())),
        other => Err(MarshalError::UnexpectedShape {
            expected: type_name,
            found: shape(other),
        }),
    }
}

fn as_enum<'a>(type_name: &'static str, val: &'a Val) -> Result<&'a str> {
    match val {
        Val::Enum(case) => Ok(case.as_str()),
        other => Err(MarshalError::UnexpectedShape {
            expected: type_name,
            found: shape(other),
        }),
    }
}

fn unit_case(type_name: &'static str, case: &str, payload: Option<&Val>) -> Result<()> {
    match payload {
        None => Ok(()),
        Some(_) => Err(MarshalError::PayloadMismatch {
            type_name,
            case: case.to_string(),
            detail: "must not carry a payload",
        }),
    }
}

fn payload_case<T: FromVal>(type_name: &'static str, case: &str, payload: Option<&Val>) -> Result<T> {
    match payload {
        Some(val) => T::from_val(val),
        None => Err(MarshalError::PayloadMismatch {
            type_name,
            case: case.to_string(),
            detail: "requires a payload",
        }),
    }
}

/// Lift a `result<T, string>` without ever treating the error case as success
pub fn decode_result<T: FromVal>(val: &Val) -> Result<std::result::Result<T, String>> {
    match val {
        Val::Result(Ok(payload)) => T::from_payload(payload.as_deref()).map(Ok),
        Val::Result(Err(Some(payload))) => match payload.as_ref() {
            Val::String(message) => Ok(Err(message.clone())),
            other => Err(unexpected("string error payload", other)),
        },
        Val::Result(Err(None)) => Err(MarshalError::UnexpectedShape {
            expected: "string error payload",
            found: "nothing".to_string(),
        }),
        other => Err(unexpected("result", other)),
    }
}

/// Lower a `result<T, string>`
pub fn encode_result<T: ToVal>(result: &std::result::Result<T, String>) -> Val {
    match result {
        Ok(value) => Val::Result(Ok(value.to_payload().map(Box::new))),
        Err(message) => Val::Result(Err(Some(Box::new(Val::String(message.clone()))))),
    }
}

// Primitives and containers

impl ToVal for () {
    fn to_val(&self) -> Val {
        Val::Tuple(Vec::new())
    }

    fn to_payload(&self) -> Option<Val> {
        None
    }
}

impl FromVal for () {
    fn from_val(val: &Val) -> Result<Self> {
        match val {
            Val::Tuple(items) if items.is_empty() => Ok(()),
            other => Err(unexpected("unit", other)),
        }
    }

    fn from_payload(payload: Option<&Val>) -> Result<Self> {
        match payload {
            None => Ok(()),
            Some(other) => Err(unexpected("no payload", other)),
        }
    }
}

impl ToVal for bool {
    fn to_val(&self) -> Val {
        Val::Bool(*self)
    }
}

impl FromVal for bool {
    fn from_val(val: &Val) -> Result<Self> {
        match val {
            Val::Bool(b) => Ok(*b),
            other => Err(unexpected("bool", other)),
        }
    }
}

impl ToVal for u32 {
    fn to_val(&self) -> Val {
        Val::U32(*self)
    }
}

impl FromVal for u32 {
    fn from_val(val: &Val) -> Result<Self> {
        match val {
            Val::U32(n) => Ok(*n),
            other => Err(unexpected("u32", other)),
        }
    }
}

impl ToVal for str {
    fn to_val(&self) -> Val {
        Val::String(self.to_string())
    }
}

impl ToVal for String {
    fn to_val(&self) -> Val {
        Val::String(self.clone())
    }
}

impl FromVal for String {
    fn from_val(val: &Val) -> Result<Self> {
        match val {
            Val::String(s) => Ok(s.clone()),
            other => Err(unexpected("string", other)),
        }
    }
}

impl<T: ToVal> ToVal for [T] {
    fn to_val(&self) -> Val {
        Val::List(self.iter().map(ToVal::to_val).collect())
    }
}

impl<T: ToVal> ToVal for Vec<T> {
    fn to_val(&self) -> Val {
        self.as_slice().to_val()
    }
}

impl<T: FromVal> FromVal for Vec<T> {
    fn from_val(val: &Val) -> Result<Self> {
        match val {
            Val::List(items) => items.iter().map(T::from_val).collect(),
            other => Err(unexpected("list", other)),
        }
    }
}

// `option<T>` always lowers to an explicit present/absent marker, so an absent
// variant is never confused with any of its cases or with an empty list.
impl<T: ToVal> ToVal for Option<T> {
    fn to_val(&self) -> Val {
        Val::Option(self.as_ref().map(|v| Box::new(v.to_val())))
    }
}

impl<T: FromVal> FromVal for Option<T> {
    fn from_val(val: &Val) -> Result<Self> {
        match val {
            Val::Option(None) => Ok(None),
            Val::Option(Some(inner)) => T::from_val(inner).map(Some),
            other => Err(unexpected("option", other)),
        }
    }
}

// Enums

impl ToVal for ValidatorResponse {
    fn to_val(&self) -> Val {
        let case = match self {
            ValidatorResponse::Yes => "yes",
            ValidatorResponse::No => "no",
            ValidatorResponse::Unknown => "unknown",
        };
        Val::Enum(case.to_string())
    }
}

impl FromVal for ValidatorResponse {
    fn from_val(val: &Val) -> Result<Self> {
        match as_enum("validator-response", val)? {
            "yes" => Ok(ValidatorResponse::Yes),
            "no" => Ok(ValidatorResponse::No),
            "unknown" => Ok(ValidatorResponse::Unknown),
            case => Err(MarshalError::UnknownCase {
                type_name: "validator-response",
                case: case.to_string(),
            }),
        }
    }
}

impl ToVal for EmailValidity {
    fn to_val(&self) -> Val {
        let case = match self {
            EmailValidity::Valid => "valid",
            EmailValidity::Invalid => "invalid",
        };
        Val::Enum(case.to_string())
    }
}

impl FromVal for EmailValidity {
    fn from_val(val: &Val) -> Result<Self> {
        match as_enum("email-validity", val)? {
            "valid" => Ok(EmailValidity::Valid),
            "invalid" => Ok(EmailValidity::Invalid),
            case => Err(MarshalError::UnknownCase {
                type_name: "email-validity",
                case: case.to_string(),
            }),
        }
    }
}

// Variants

impl ToVal for SensitiveInfoEntity {
    fn to_val(&self) -> Val {
        match self {
            SensitiveInfoEntity::Email => variant("email", None),
            SensitiveInfoEntity::PhoneNumber => variant("phone-number", None),
            SensitiveInfoEntity::IpAddress => variant("ip-address", None),
            SensitiveInfoEntity::CreditCardNumber => variant("credit-card-number", None),
            SensitiveInfoEntity::Custom(name) => variant("custom", Some(name.to_val())),
        }
    }
}

impl FromVal for SensitiveInfoEntity {
    fn from_val(val: &Val) -> Result<Self> {
        const TYPE: &str = "sensitive-info-entity";
        let (case, payload) = as_variant(TYPE, val)?;
        match case {
            "email" => unit_case(TYPE, case, payload).map(|_| SensitiveInfoEntity::Email),
            "phone-number" => unit_case(TYPE, case, payload).map(|_| SensitiveInfoEntity::PhoneNumber),
            "ip-address" => unit_case(TYPE, case, payload).map(|_| SensitiveInfoEntity::IpAddress),
            "credit-card-number" => {
                unit_case(TYPE, case, payload).map(|_| SensitiveInfoEntity::CreditCardNumber)
            }
            "custom" => payload_case(TYPE, case, payload).map(SensitiveInfoEntity::Custom),
            _ => Err(MarshalError::UnknownCase {
                type_name: TYPE,
                case: case.to_string(),
            }),
        }
    }
}

impl ToVal for SensitiveInfoEntities {
    fn to_val(&self) -> Val {
        match self {
            SensitiveInfoEntities::Allow(entities) => variant("allow", Some(entities.to_val())),
            SensitiveInfoEntities::Deny(entities) => variant("deny", Some(entities.to_val())),
        }
    }
}

impl FromVal for SensitiveInfoEntities {
    fn from_val(val: &Val) -> Result<Self> {
        const TYPE: &str = "sensitive-info-entities";
        let (case, payload) = as_variant(TYPE, val)?;
        match case {
            "allow" => payload_case(TYPE, case, payload).map(SensitiveInfoEntities::Allow),
            "deny" => payload_case(TYPE, case, payload).map(SensitiveInfoEntities::Deny),
            _ => Err(MarshalError::UnknownCase {
                type_name: TYPE,
                case: case.to_string(),
            }),
        }
    }
}

impl ToVal for BotConfig {
    fn to_val(&self) -> Val {
        match self {
            BotConfig::Allowed(config) => variant("allowed-bot-config", Some(config.to_val())),
            BotConfig::Denied(config) => variant("denied-bot-config", Some(config.to_val())),
        }
    }
}

impl FromVal for BotConfig {
    fn from_val(val: &Val) -> Result<Self> {
        const TYPE: &str = "bot-config";
        let (case, payload) = as_variant(TYPE, val)?;
        match case {
            "allowed-bot-config" => payload_case(TYPE, case, payload).map(BotConfig::Allowed),
            "denied-bot-config" => payload_case(TYPE, case, payload).map(BotConfig::Denied),
            _ => Err(MarshalError::UnknownCase {
                type_name: TYPE,
                case: case.to_string(),
            }),
        }
    }
}

impl ToVal for EmailValidationConfig {
    fn to_val(&self) -> Val {
        match self {
            EmailValidationConfig::Allow(config) => {
                variant("allow-email-validation-config", Some(config.to_val()))
            }
            EmailValidationConfig::Deny(config) => {
                variant("deny-email-validation-config", Some(config.to_val()))
            }
        }
    }
}

impl FromVal for EmailValidationConfig {
    fn from_val(val: &Val) -> Result<Self> {
        const TYPE: &str = "email-validation-config";
        let (case, payload) = as_variant(TYPE, val)?;
        match case {
            "allow-email-validation-config" => {
                payload_case(TYPE, case, payload).map(EmailValidationConfig::Allow)
            }
            "deny-email-validation-config" => {
                payload_case(TYPE, case, payload).map(EmailValidationConfig::Deny)
            }
            _ => Err(MarshalError::UnknownCase {
                type_name: TYPE,
                case: case.to_string(),
            }),
        }
    }
}

// Records

impl ToVal for AllowedBotConfig {
    fn to_val(&self) -> Val {
        record([
            ("entities", self.entities.to_val()),
            ("skip_custom_detect", self.skip_custom_detect.to_val()),
        ])
    }
}

impl FromVal for AllowedBotConfig {
    fn from_val(val: &Val) -> Result<Self> {
        let fields = RecordFields::new("allowed-bot-config", val, &["entities", "skip_custom_detect"])?;
        Ok(Self {
            entities: fields.get("entities")?,
            skip_custom_detect: fields.get("skip_custom_detect")?,
        })
    }
}

impl ToVal for DeniedBotConfig {
    fn to_val(&self) -> Val {
        record([
            ("entities", self.entities.to_val()),
            ("skip_custom_detect", self.skip_custom_detect.to_val()),
        ])
    }
}

impl FromVal for DeniedBotConfig {
    fn from_val(val: &Val) -> Result<Self> {
        let fields = RecordFields::new("denied-bot-config", val, &["entities", "skip_custom_detect"])?;
        Ok(Self {
            entities: fields.get("entities")?,
            skip_custom_detect: fields.get("skip_custom_detect")?,
        })
    }
}

impl ToVal for BotResult {
    fn to_val(&self) -> Val {
        record([
            ("allowed", self.allowed.to_val()),
            ("denied", self.denied.to_val()),
            ("verified", self.verified.to_val()),
            ("spoofed", self.spoofed.to_val()),
        ])
    }
}

impl FromVal for BotResult {
    fn from_val(val: &Val) -> Result<Self> {
        let fields = RecordFields::new("bot-result", val, &["allowed", "denied", "verified", "spoofed"])?;
        Ok(Self {
            allowed: fields.get("allowed")?,
            denied: fields.get("denied")?,
            verified: fields.get("verified")?,
            spoofed: fields.get("spoofed")?,
        })
    }
}

impl ToVal for FilterResult {
    fn to_val(&self) -> Val {
        record([
            ("allowed", self.allowed.to_val()),
            ("matched_expressions", self.matched_expressions.to_val()),
            ("undetermined_expressions", self.undetermined_expressions.to_val()),
        ])
    }
}

impl FromVal for FilterResult {
    fn from_val(val: &Val) -> Result<Self> {
        let fields = RecordFields::new(
            "filter-result",
            val,
            &["allowed", "matched_expressions", "undetermined_expressions"],
        )?;
        Ok(Self {
            allowed: fields.get("allowed")?,
            matched_expressions: fields.get("matched_expressions")?,
            undetermined_expressions: fields.get("undetermined_expressions")?,
        })
    }
}

impl ToVal for AllowEmailValidationConfig {
    fn to_val(&self) -> Val {
        record([
            ("require_top_level_domain", self.require_top_level_domain.to_val()),
            ("allow_domain_literal", self.allow_domain_literal.to_val()),
            ("allow", self.allow.to_val()),
        ])
    }
}

impl FromVal for AllowEmailValidationConfig {
    fn from_val(val: &Val) -> Result<Self> {
        let fields = RecordFields::new(
            "allow-email-validation-config",
            val,
            &["require_top_level_domain", "allow_domain_literal", "allow"],
        )?;
        Ok(Self {
            require_top_level_domain: fields.get("require_top_level_domain")?,
            allow_domain_literal: fields.get("allow_domain_literal")?,
            allow: fields.get("allow")?,
        })
    }
}

impl ToVal for DenyEmailValidationConfig {
    fn to_val(&self) -> Val {
        record([
            ("require_top_level_domain", self.require_top_level_domain.to_val()),
            ("allow_domain_literal", self.allow_domain_literal.to_val()),
            ("deny", self.deny.to_val()),
        ])
    }
}

impl FromVal for DenyEmailValidationConfig {
    fn from_val(val: &Val) -> Result<Self> {
        let fields = RecordFields::new(
            "deny-email-validation-config",
            val,
            &["require_top_level_domain", "allow_domain_literal", "deny"],
        )?;
        Ok(Self {
            require_top_level_domain: fields.get("require_top_level_domain")?,
            allow_domain_literal: fields.get("allow_domain_literal")?,
            deny: fields.get("deny")?,
        })
    }
}

impl ToVal for EmailValidationResult {
    fn to_val(&self) -> Val {
        record([
            ("validity", self.validity.to_val()),
            ("blocked", self.blocked.to_val()),
        ])
    }
}

impl FromVal for EmailValidationResult {
    fn from_val(val: &Val) -> Result<Self> {
        let fields = RecordFields::new("email-validation-result", val, &["validity", "blocked"])?;
        Ok(Self {
            validity: fields.get("validity")?,
            blocked: fields.get("blocked")?,
        })
    }
}

impl ToVal for SensitiveInfoConfig {
    fn to_val(&self) -> Val {
        record([
            ("entities", self.entities.to_val()),
            ("context_window_size", self.context_window_size.to_val()),
            ("skip_custom_detect", self.skip_custom_detect.to_val()),
        ])
    }
}

impl FromVal for SensitiveInfoConfig {
    fn from_val(val: &Val) -> Result<Self> {
        let fields = RecordFields::new(
            "sensitive-info-config",
            val,
            &["entities", "context_window_size", "skip_custom_detect"],
        )?;
        Ok(Self {
            entities: fields.get("entities")?,
            context_window_size: fields.get("context_window_size")?,
            skip_custom_detect: fields.get("skip_custom_detect")?,
        })
    }
}

impl ToVal for DetectedSensitiveInfoEntity {
    fn to_val(&self) -> Val {
        record([
            ("start", self.start.to_val()),
            ("end", self.end.to_val()),
            ("identified_type", self.identified_type.to_val()),
        ])
    }
}

impl FromVal for DetectedSensitiveInfoEntity {
    fn from_val(val: &Val) -> Result<Self> {
        let fields = RecordFields::new(
            "detected-sensitive-info-entity",
            val,
            &["start", "end", "identified_type"],
        )?;
        Ok(Self {
            start: fields.get("start")?,
            end: fields.get("end")?,
            identified_type: fields.get("identified_type")?,
        })
    }
}

impl ToVal for SensitiveInfoResult {
    fn to_val(&self) -> Val {
        record([
            ("allowed", self.allowed.to_val()),
            ("denied", self.denied.to_val()),
        ])
    }
}

impl FromVal for SensitiveInfoResult {
    fn from_val(val: &Val) -> Result<Self> {
        let fields = RecordFields::new("sensitive-info-result", val, &["allowed", "denied"])?;
        Ok(Self {
            allowed: fields.get("allowed")?,
            denied: fields.get("denied")?,
        })
    }
}
