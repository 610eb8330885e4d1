use std::collections::HashSet;

use crate::config::DataplaneConfig;

/// iptables refuses chain names longer than this.
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Validates a dataplane configuration before anything touches the firewall
pub struct ConfigValidator<'a> {
    config: &'a DataplaneConfig,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(config: &'a DataplaneConfig) -> Self {
        Self { config }
    }

    /// Run all validations
    pub fn validate(&self) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();

        warnings.extend(self.check_chain_names());
        warnings.extend(self.check_fixed_chain_conflicts());
        warnings.extend(self.check_deprecated_overlap());
        warnings.extend(self.check_marks());
        warnings.extend(self.check_timing());

        warnings
    }

    fn check_chain_names(&self) -> Vec<ValidationWarning> {
        let chains = &self.config.chains;
        let mut names: Vec<(&str, &str)> = vec![
            ("top_level", chains.top_level.as_str()),
            ("ingress", chains.ingress.as_str()),
            ("ingress_allow_mark", chains.ingress_allow_mark.as_str()),
            ("egress", chains.egress.as_str()),
            ("accept", chains.accept.as_str()),
            ("ingress_policy_prefix", chains.ingress_policy_prefix.as_str()),
            ("egress_policy_prefix", chains.egress_policy_prefix.as_str()),
        ];
        names.extend(chains.deprecated.iter().map(|c| ("deprecated", c.as_str())));

        names
            .into_iter()
            .filter_map(|(field, name)| {
                let reason = if name.is_empty() {
                    "name is empty"
                } else if name.len() > MAX_CHAIN_NAME_LEN {
                    "name is longer than 28 characters"
                } else if name.chars().any(char::is_whitespace) {
                    "name contains whitespace"
                } else {
                    return None;
                };
                Some(ValidationWarning::InvalidChainName {
                    field: field.to_string(),
                    name: name.to_string(),
                    reason: reason.to_string(),
                })
            })
            .collect()
    }

    /// Fixed chains must be distinct and must not be the chains we share
    /// with other components.
    fn check_fixed_chain_conflicts(&self) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();
        let mut seen = HashSet::new();
        let iptables = &self.config.iptables;

        for chain in self.config.chains.fixed() {
            if !seen.insert(chain) {
                warnings.push(ValidationWarning::DuplicateChain {
                    name: chain.to_string(),
                });
            }
            if chain == iptables.shared_chain || chain == iptables.services_chain {
                warnings.push(ValidationWarning::ForeignChainCollision {
                    name: chain.to_string(),
                });
            }
        }

        warnings
    }

    fn check_deprecated_overlap(&self) -> Vec<ValidationWarning> {
        self.config
            .chains
            .deprecated
            .iter()
            .filter(|c| self.config.chains.is_fixed(c.as_str()))
            .map(|c| ValidationWarning::DeprecatedIsFixed { name: c.clone() })
            .collect()
    }

    fn check_marks(&self) -> Vec<ValidationWarning> {
        let marks = &self.config.marks;
        [
            ("ingress_allow", &marks.ingress_allow),
            ("ingress_drop", &marks.ingress_drop),
            ("egress_drop", &marks.egress_drop),
            ("clear", &marks.clear),
        ]
        .into_iter()
        .filter(|(_, value)| !Self::is_hex_mark(value.as_str()))
        .map(|(field, value)| ValidationWarning::InvalidMark {
            field: field.to_string(),
            value: value.clone(),
        })
        .collect()
    }

    fn check_timing(&self) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();
        if self.config.iptables.lock_wait_secs == 0 {
            warnings.push(ValidationWarning::ZeroDuration {
                field: "iptables.lock_wait_secs".to_string(),
            });
        }
        if self.config.reconcile_interval_secs == 0 {
            warnings.push(ValidationWarning::ZeroDuration {
                field: "reconcile_interval_secs".to_string(),
            });
        }
        warnings
    }

    /// `0x` followed by 1-8 hex digits
    fn is_hex_mark(value: &str) -> bool {
        value
            .strip_prefix("0x")
            .is_some_and(|digits| {
                !digits.is_empty()
                    && digits.len() <= 8
                    && digits.chars().all(|c| c.is_ascii_hexdigit())
            })
    }
}

/// Validation findings; only some of them block startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    InvalidChainName {
        field: String,
        name: String,
        reason: String,
    },
    DuplicateChain {
        name: String,
    },
    ForeignChainCollision {
        name: String,
    },
    DeprecatedIsFixed {
        name: String,
    },
    InvalidMark {
        field: String,
        value: String,
    },
    ZeroDuration {
        field: String,
    },
}

impl ValidationWarning {
    pub fn display(&self) {
        match self {
            Self::InvalidChainName {
                field,
                name,
                reason,
            } => {
                println!("❌ Invalid chain name in '{}':", field);
                println!("   Name: {:?}", name);
                println!("   Reason: {}", reason);
            }
            Self::DuplicateChain { name } => {
                println!("❌ Chain {} is configured for more than one role", name);
            }
            Self::ForeignChainCollision { name } => {
                println!("❌ Chain {} is shared with other components and cannot be owned", name);
            }
            Self::DeprecatedIsFixed { name } => {
                println!("⚠️  Deprecated chain {} is also a current chain", name);
            }
            Self::InvalidMark { field, value } => {
                println!("❌ Invalid mark in '{}':", field);
                println!("   Value: {:?} (expected hex such as 0x2000)", value);
            }
            Self::ZeroDuration { field } => {
                println!("❌ {} must be greater than zero", field);
            }
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            Self::InvalidChainName { .. }
            | Self::DuplicateChain { .. }
            | Self::ForeignChainCollision { .. }
            | Self::InvalidMark { .. }
            | Self::ZeroDuration { .. } => true,
            Self::DeprecatedIsFixed { .. } => false,
        }
    }
}
