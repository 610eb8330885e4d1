use serde::{Deserialize, Serialize};

/// Everything the dataplane needs to know about naming and tooling.
///
/// Chain names and mark values are plain data passed to the policy manager at
/// construction so tests (or a future naming scheme) can swap them out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    pub iptables: IptablesConfig,
    pub chains: ChainNames,
    pub marks: MarkConfig,
    pub hns: HnsConfig,
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IptablesConfig {
    pub binary: String,
    pub restore_binary: String,
    pub grep_binary: String,
    /// Seconds to wait for the xtables lock, passed as `-w` on every call.
    pub lock_wait_secs: u32,
    pub table: String,
    /// Chain shared with other components that receives our jump rule.
    pub shared_chain: String,
    /// Chain whose jump must stay ahead of ours in the shared chain.
    pub services_chain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainNames {
    pub top_level: String,
    pub ingress: String,
    pub ingress_allow_mark: String,
    pub egress: String,
    pub accept: String,
    /// Names used by earlier generations. Only ever flushed and destroyed.
    pub deprecated: Vec<String>,
    pub ingress_policy_prefix: String,
    pub egress_policy_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkConfig {
    pub ingress_allow: String,
    pub ingress_drop: String,
    pub egress_drop: String,
    pub clear: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnsConfig {
    pub network_name: String,
    pub policy_id_prefix: String,
}

impl DataplaneConfig {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

impl ChainNames {
    /// The infrastructure chains in creation order.
    pub fn fixed(&self) -> [&str; 5] {
        [
            &self.top_level,
            &self.ingress,
            &self.ingress_allow_mark,
            &self.egress,
            &self.accept,
        ]
    }

    pub fn is_fixed(&self, chain: &str) -> bool {
        self.fixed().contains(&chain)
    }

    pub fn is_deprecated(&self, chain: &str) -> bool {
        self.deprecated.iter().any(|c| c == chain)
    }

    /// True for dynamic per-policy chains created under our own prefixes.
    ///
    /// Fixed and deprecated names are excluded even when they share a prefix
    /// (e.g. `KFENCE-INGRESS-ALLOW-MARK`).
    pub fn is_policy_chain(&self, chain: &str) -> bool {
        if self.is_fixed(chain) || self.is_deprecated(chain) {
            return false;
        }
        [&self.ingress_policy_prefix, &self.egress_policy_prefix]
            .iter()
            .any(|prefix| {
                chain
                    .strip_prefix(prefix.as_str())
                    .and_then(|rest| rest.strip_prefix('-'))
                    .is_some_and(|suffix| !suffix.is_empty())
            })
    }

    /// Any chain this engine may create, flush or destroy.
    pub fn is_owned(&self, chain: &str) -> bool {
        self.is_fixed(chain) || self.is_deprecated(chain) || self.is_policy_chain(chain)
    }

    /// Fixed chains followed by deprecated ones, without duplicates.
    pub fn fixed_and_deprecated(&self) -> Vec<String> {
        let mut chains: Vec<String> = Vec::with_capacity(5 + self.deprecated.len());
        for chain in self.fixed().into_iter().chain(self.deprecated.iter().map(String::as_str)) {
            if !chains.iter().any(|c| c == chain) {
                chains.push(chain.to_string());
            }
        }
        chains
    }
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            iptables: IptablesConfig::default(),
            chains: ChainNames::default(),
            marks: MarkConfig::default(),
            hns: HnsConfig::default(),
            reconcile_interval_secs: 300,
        }
    }
}

impl Default for IptablesConfig {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
            restore_binary: "iptables-restore".to_string(),
            grep_binary: "grep".to_string(),
            lock_wait_secs: 60,
            table: "filter".to_string(),
            shared_chain: "FORWARD".to_string(),
            services_chain: "KUBE-SERVICES".to_string(),
        }
    }
}

impl Default for ChainNames {
    fn default() -> Self {
        Self {
            top_level: "KFENCE".to_string(),
            ingress: "KFENCE-INGRESS".to_string(),
            ingress_allow_mark: "KFENCE-INGRESS-ALLOW-MARK".to_string(),
            egress: "KFENCE-EGRESS".to_string(),
            accept: "KFENCE-ACCEPT".to_string(),
            deprecated: [
                // v1 chains
                "KFENCE-INGRESS-FROM",
                "KFENCE-INGRESS-PORT",
                "KFENCE-INGRESS-DROPS",
                "KFENCE-EGRESS-TO",
                "KFENCE-EGRESS-PORT",
                "KFENCE-EGRESS-DROPS",
                // older
                "KFENCE-TARGET-SETS",
                "KFENCE-INRGESS-DROPS",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            ingress_policy_prefix: "KFENCE-INGRESS".to_string(),
            egress_policy_prefix: "KFENCE-EGRESS".to_string(),
        }
    }
}

impl Default for MarkConfig {
    fn default() -> Self {
        Self {
            ingress_allow: "0x2000".to_string(),
            ingress_drop: "0x4000".to_string(),
            egress_drop: "0x5000".to_string(),
            clear: "0x0".to_string(),
        }
    }
}

impl Default for HnsConfig {
    fn default() -> Self {
        Self {
            network_name: "kfence".to_string(),
            policy_id_prefix: "kfence".to_string(),
        }
    }
}
