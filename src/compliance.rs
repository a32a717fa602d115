use async_trait::async_trait;

use crate::model::Amount;

/// Pre-admission screening verdict. Advisory: a deny fails `CreatePayment`
/// before any payment event is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenVerdict {
    pub allow: bool,
    pub reason: Option<String>,
}

impl ScreenVerdict {
    pub fn allow() -> Self {
        ScreenVerdict { allow: true, reason: None }
    }

    pub fn deny(reason: &str) -> Self {
        ScreenVerdict { allow: false, reason: Some(reason.to_string()) }
    }
}

/// Synchronous screen invoked during admission.
#[async_trait]
pub trait ComplianceChecker: Send + Sync {
    async fn screen(
        &self,
        user: &str,
        merchant: &str,
        principal: Amount,
        currency: &str,
    ) -> ScreenVerdict;
}

/// Pass-through checker for environments where screening happens upstream.
pub struct AllowAll;

#[async_trait]
impl ComplianceChecker for AllowAll {
    async fn screen(&self, _: &str, _: &str, _: Amount, _: &str) -> ScreenVerdict {
        ScreenVerdict::allow()
    }
}

/// Denies any payment touching a listed party.
pub struct DenyList {
    parties: Vec<String>,
}

impl DenyList {
    pub fn new(parties: Vec<String>) -> Self {
        DenyList { parties }
    }
}

#[async_trait]
impl ComplianceChecker for DenyList {
    async fn screen(&self, user: &str, merchant: &str, _: Amount, _: &str) -> ScreenVerdict {
        for party in [user, merchant] {
            if self.parties.iter().any(|p| p == party) {
                return ScreenVerdict::deny(&format!("party {party} is denylisted"));
            }
        }
        ScreenVerdict::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denylist_blocks_either_party() {
        let checker = DenyList::new(vec!["sanctioned".into()]);
        let amount = Amount::from_micros(1_000_000);
        assert!(!checker.screen("sanctioned", "acme", amount, "USDC").await.allow);
        assert!(!checker.screen("alice", "sanctioned", amount, "USDC").await.allow);
        assert!(checker.screen("alice", "acme", amount, "USDC").await.allow);
    }
}
