// ABI Module - Names that make up the contract between the host and the analysis component
//
// The component is built against a fixed WIT world. Every export and import the
// bridge touches is named here, and any mismatch is reported when the component
// is loaded rather than when a function is first called.

use std::fmt;

/// Version of the component world this bridge marshals for
pub const WORLD_VERSION: &str = "arcjet:js-req@1";

/// Export: `match-filters(request, expressions, allow-if-match) -> result<filter-result, string>`
pub const MATCH_FILTERS_FN: &str = "match-filters";

/// Export: `detect-bot(request, options) -> result<bot-result, string>`
pub const DETECT_BOT_FN: &str = "detect-bot";

/// Export: `generate-fingerprint(request, characteristics) -> result<string, string>`
pub const GENERATE_FINGERPRINT_FN: &str = "generate-fingerprint";

/// Export: `validate-characteristics(request, characteristics) -> result<_, string>`
pub const VALIDATE_CHARACTERISTICS_FN: &str = "validate-characteristics";

/// Export: `is-valid-email(candidate, options) -> result<email-validation-result, string>`
pub const IS_VALID_EMAIL_FN: &str = "is-valid-email";

/// Export: `detect-sensitive-info(content, options) -> sensitive-info-result`
pub const DETECT_SENSITIVE_INFO_FN: &str = "detect-sensitive-info";

/// All functions the component must export
pub const REQUIRED_EXPORTS: [&str; 6] = [
    MATCH_FILTERS_FN,
    DETECT_BOT_FN,
    GENERATE_FINGERPRINT_FN,
    VALIDATE_CHARACTERISTICS_FN,
    IS_VALID_EMAIL_FN,
    DETECT_SENSITIVE_INFO_FN,
];

/// Structural shape of a value type in the component world
///
/// Records list their fields and enums their cases in declaration order,
/// since values are lowered positionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Bool,
    U32,
    String,
    List(&'static Shape),
    Option(&'static Shape),
    /// `result<ok, err>`, `None` where the case carries no payload
    Result(Option<&'static Shape>, Option<&'static Shape>),
    Record(&'static [(&'static str, Shape)]),
    Variant(&'static [(&'static str, Option<Shape>)]),
    Enum(&'static [&'static str]),
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Bool => write!(f, "bool"),
            Shape::U32 => write!(f, "u32"),
            Shape::String => write!(f, "string"),
            Shape::List(inner) => write!(f, "list<{}>", inner),
            Shape::Option(inner) => write!(f, "option<{}>", inner),
            Shape::Result(ok, err) => {
                let slot = |s: &Option<&Shape>| s.map_or_else(|| "_".to_string(), |s| s.to_string());
                write!(f, "result<{}, {}>", slot(ok), slot(err))
            }
            Shape::Record(fields) => {
                let fields: Vec<String> = fields.iter().map(|(name, ty)| format!("{}: {}", name, ty)).collect();
                write!(f, "record {{ {} }}", fields.join(", "))
            }
            Shape::Variant(cases) => {
                let cases: Vec<String> = cases
                    .iter()
                    .map(|(name, ty)| match ty {
                        Some(ty) => format!("{}({})", name, ty),
                        None => name.to_string(),
                    })
                    .collect();
                write!(f, "variant {{ {} }}", cases.join(", "))
            }
            Shape::Enum(cases) => write!(f, "enum {{ {} }}", cases.join(", ")),
        }
    }
}

const STRINGS: Shape = Shape::List(&Shape::String);

const BOT_CONFIG_FIELDS: &[(&str, Shape)] = &[("entities", STRINGS), ("skip-custom-detect", Shape::Bool)];

pub const BOT_CONFIG: Shape = Shape::Variant(&[
    ("allowed-bot-config", Some(Shape::Record(BOT_CONFIG_FIELDS))),
    ("denied-bot-config", Some(Shape::Record(BOT_CONFIG_FIELDS))),
]);

pub const BOT_RESULT: Shape = Shape::Record(&[
    ("allowed", STRINGS),
    ("denied", STRINGS),
    ("verified", Shape::Bool),
    ("spoofed", Shape::Bool),
]);

pub const FILTER_RESULT: Shape = Shape::Record(&[
    ("allowed", Shape::Bool),
    ("matched-expressions", STRINGS),
    ("undetermined-expressions", STRINGS),
]);

pub const EMAIL_VALIDATION_CONFIG: Shape = Shape::Variant(&[
    (
        "allow-email-validation-config",
        Some(Shape::Record(&[
            ("require-top-level-domain", Shape::Bool),
            ("allow-domain-literal", Shape::Bool),
            ("allow", STRINGS),
        ])),
    ),
    (
        "deny-email-validation-config",
        Some(Shape::Record(&[
            ("require-top-level-domain", Shape::Bool),
            ("allow-domain-literal", Shape::Bool),
            ("deny", STRINGS),
        ])),
    ),
]);

pub const EMAIL_VALIDATION_RESULT: Shape = Shape::Record(&[
    ("validity", Shape::Enum(&["valid", "invalid"])),
    ("blocked", STRINGS),
]);

pub const SENSITIVE_INFO_ENTITY: Shape = Shape::Variant(&[
    ("email", None),
    ("phone-number", None),
    ("ip-address", None),
    ("credit-card-number", None),
    ("custom", Some(Shape::String)),
]);

const SENSITIVE_INFO_ENTITY_LIST: Shape = Shape::List(&SENSITIVE_INFO_ENTITY);

pub const SENSITIVE_INFO_CONFIG: Shape = Shape::Record(&[
    (
        "entities",
        Shape::Variant(&[
            ("allow", Some(SENSITIVE_INFO_ENTITY_LIST)),
            ("deny", Some(SENSITIVE_INFO_ENTITY_LIST)),
        ]),
    ),
    ("context-window-size", Shape::Option(&Shape::U32)),
    ("skip-custom-detect", Shape::Bool),
]);

const DETECTED_SENSITIVE_INFO_LIST: Shape = Shape::List(&Shape::Record(&[
    ("start", Shape::U32),
    ("end", Shape::U32),
    ("identified-type", SENSITIVE_INFO_ENTITY),
]));

pub const SENSITIVE_INFO_RESULT: Shape = Shape::Record(&[
    ("allowed", DETECTED_SENSITIVE_INFO_LIST),
    ("denied", DETECTED_SENSITIVE_INFO_LIST),
]);

/// Parameter and result shapes of one export
#[derive(Debug, Clone, Copy)]
pub struct ExportSignature {
    pub name: &'static str,
    pub params: &'static [Shape],
    pub result: Shape,
}

impl fmt::Display for ExportSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(Shape::to_string).collect();
        write!(f, "{}({}) -> {}", self.name, params.join(", "), self.result)
    }
}

/// Signatures every export must have, checked when the component is loaded
pub const EXPORT_SIGNATURES: [ExportSignature; 6] = [
    ExportSignature {
        name: MATCH_FILTERS_FN,
        params: &[Shape::String, STRINGS, Shape::Bool],
        result: Shape::Result(Some(&FILTER_RESULT), Some(&Shape::String)),
    },
    ExportSignature {
        name: DETECT_BOT_FN,
        params: &[Shape::String, BOT_CONFIG],
        result: Shape::Result(Some(&BOT_RESULT), Some(&Shape::String)),
    },
    ExportSignature {
        name: GENERATE_FINGERPRINT_FN,
        params: &[Shape::String, STRINGS],
        result: Shape::Result(Some(&Shape::String), Some(&Shape::String)),
    },
    ExportSignature {
        name: VALIDATE_CHARACTERISTICS_FN,
        params: &[Shape::String, STRINGS],
        result: Shape::Result(None, Some(&Shape::String)),
    },
    ExportSignature {
        name: IS_VALID_EMAIL_FN,
        params: &[Shape::String, EMAIL_VALIDATION_CONFIG],
        result: Shape::Result(Some(&EMAIL_VALIDATION_RESULT), Some(&Shape::String)),
    },
    ExportSignature {
        name: DETECT_SENSITIVE_INFO_FN,
        params: &[Shape::String, SENSITIVE_INFO_CONFIG],
        result: SENSITIVE_INFO_RESULT,
    },
];

/// Import interface: IP reputation lookup used by filter expressions
pub const FILTER_OVERRIDES_IFACE: &str = "arcjet:js-req/filter-overrides";
pub const IP_LOOKUP_FN: &str = "ip-lookup";

/// Import interface: custom bot identification
pub const BOT_IDENTIFIER_IFACE: &str = "arcjet:js-req/bot-identifier";
pub const BOT_DETECT_FN: &str = "detect";

/// Import interface: bot IP verification
pub const VERIFY_BOT_IFACE: &str = "arcjet:js-req/verify-bot";
pub const VERIFY_FN: &str = "verify";

/// Import interface: email validator overrides
pub const EMAIL_OVERRIDES_IFACE: &str = "arcjet:js-req/email-validator-overrides";
pub const IS_FREE_EMAIL_FN: &str = "is-free-email";
pub const IS_DISPOSABLE_EMAIL_FN: &str = "is-disposable-email";
pub const HAS_MX_RECORDS_FN: &str = "has-mx-records";
pub const HAS_GRAVATAR_FN: &str = "has-gravatar";

/// Import interface: custom sensitive information identification
pub const SENSITIVE_INFO_IFACE: &str = "arcjet:js-req/sensitive-information-identifier";
pub const SENSITIVE_DETECT_FN: &str = "detect";

/// Convert a native (snake_case) identifier to its ABI (kebab-case) name
pub fn to_abi_name(native: &str) -> String {
    native.replace('_', "-")
}

/// Convert an ABI (kebab-case) identifier to its native (snake_case) name
pub fn to_native_name(abi: &str) -> String {
    abi.replace('-', "_")
}
