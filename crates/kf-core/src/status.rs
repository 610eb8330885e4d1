use serde::{Deserialize, Serialize};

/// Read-only snapshot of the dataplane as seen on the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataplaneStatus {
    pub backend: String,
    pub shared_chain: String,
    /// 1-based line of our jump rule in the shared chain, 0 when missing.
    pub jump_line: usize,
    pub services_chain: String,
    /// 1-based line of the services jump, 0 when missing.
    pub services_line: usize,
    pub policy_chains: Vec<String>,
    pub stale_chains: Vec<String>,
}

impl DataplaneStatus {
    pub fn jump_present(&self) -> bool {
        self.jump_line > 0
    }

    /// The jump must come after the services jump whenever both exist.
    pub fn ordering_ok(&self) -> bool {
        self.jump_present() && (self.services_line == 0 || self.services_line < self.jump_line)
    }

    pub fn display(&self) {
        println!("📊 Dataplane Status ({})\n", self.backend);

        if self.jump_present() {
            println!(
                "↪️  Jump rule: line {} of {}",
                self.jump_line, self.shared_chain
            );
        } else {
            println!("↪️  Jump rule: missing from {}", self.shared_chain);
        }

        if self.services_line > 0 {
            println!(
                "   {} jump at line {}",
                self.services_chain, self.services_line
            );
        } else {
            println!("   {} jump not present", self.services_chain);
        }

        if self.ordering_ok() {
            println!("   ✅ Ordering correct");
        } else {
            println!("   ⚠️  Ordering needs repair (run reconcile)");
        }

        println!("\n🔗 Policy chains ({}):", self.policy_chains.len());
        if self.policy_chains.is_empty() {
            println!("  (none)");
        } else {
            for chain in &self.policy_chains {
                println!("  • {}", chain);
            }
        }

        println!("\n🧹 Stale chains ({}):", self.stale_chains.len());
        if self.stale_chains.is_empty() {
            println!("  (none)");
        } else {
            for chain in &self.stale_chains {
                println!("  • {}", chain);
            }
        }
    }
}
