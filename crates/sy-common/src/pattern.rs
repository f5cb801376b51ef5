use serde::{Deserialize, Serialize};
use std::fmt;

/// Message exchange pattern. Declares which of IN/OUT/FAULT are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExchangePattern {
    #[default]
    InOnly,
    RobustInOnly,
    InOut,
    InOptionalOut,
    OutOnly,
    RobustOutOnly,
    OutIn,
    OutOptionalIn,
}

const WSDL_2006: &str = "http://www.w3.org/ns/wsdl/";
const WSDL_2004: &str = "http://www.w3.org/2004/08/wsdl/";

impl ExchangePattern {
    pub const ALL: [ExchangePattern; 8] = [
        ExchangePattern::InOnly,
        ExchangePattern::RobustInOnly,
        ExchangePattern::InOut,
        ExchangePattern::InOptionalOut,
        ExchangePattern::OutOnly,
        ExchangePattern::RobustOutOnly,
        ExchangePattern::OutIn,
        ExchangePattern::OutOptionalIn,
    ];

    pub fn is_in_capable(&self) -> bool {
        !matches!(self, Self::OutOnly | Self::RobustOutOnly)
    }

    pub fn is_out_capable(&self) -> bool {
        !matches!(self, Self::InOnly | Self::RobustInOnly)
    }

    pub fn is_fault_capable(&self) -> bool {
        !matches!(self, Self::InOnly | Self::OutOnly)
    }

    fn wsdl_suffix(&self) -> &'static str {
        match self {
            Self::InOnly => "in-only",
            Self::RobustInOnly => "robust-in-only",
            Self::InOut => "in-out",
            Self::InOptionalOut => "in-opt-out",
            Self::OutOnly => "out-only",
            Self::RobustOutOnly => "robust-out-only",
            Self::OutIn => "out-in",
            Self::OutOptionalIn => "out-opt-in",
        }
    }

    /// WSDL 2.0 MEP URI for this pattern
    pub fn wsdl_uri(&self) -> String {
        format!("{}{}", WSDL_2006, self.wsdl_suffix())
    }

    /// Resolves a WSDL MEP URI. Both the 2006 and the 2004 draft namespaces are accepted.
    pub fn from_wsdl_uri(uri: &str) -> Option<Self> {
        let suffix = uri
            .strip_prefix(WSDL_2006)
            .or_else(|| uri.strip_prefix(WSDL_2004))?;
        Self::ALL.into_iter().find(|p| p.wsdl_suffix() == suffix)
    }

    /// Parses the enum name (as used in endpoint options such as `exchangePattern=InOut`).
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str().eq_ignore_ascii_case(name))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InOnly => "InOnly",
            Self::RobustInOnly => "RobustInOnly",
            Self::InOut => "InOut",
            Self::InOptionalOut => "InOptionalOut",
            Self::OutOnly => "OutOnly",
            Self::RobustOutOnly => "RobustOutOnly",
            Self::OutIn => "OutIn",
            Self::OutOptionalIn => "OutOptionalIn",
        }
    }
}

impl fmt::Display for ExchangePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
