//! Per-session capabilities.
//!
//! A grant is an optional allow-all, a per-service permission bitmask, and an
//! ordered list of command prefix allow-lists. Allow-lists match token by
//! token; `*` matches exactly one token and `...` matches the remainder.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::service::ServiceKind;

/// Read permission bit.
pub const CAP_R: u8 = 0x1;
/// Write permission bit.
pub const CAP_W: u8 = 0x2;
/// Execute/coordinate permission bit (required for peer protocols).
pub const CAP_X: u8 = 0x4;

/// Capabilities attached to a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityGrant {
    allow_all: bool,
    per_service: BTreeMap<ServiceKind, u8>,
    cmd_allow: Vec<Vec<String>>,
}

impl CapabilityGrant {
    /// The grant given to authenticated peer monitors.
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            ..Default::default()
        }
    }

    /// Whether this grant bypasses all checks.
    pub fn is_allow_all(&self) -> bool {
        self.allow_all
    }

    /// Grant `bits` on `service`.
    pub fn grant(&mut self, service: ServiceKind, bits: u8) {
        *self.per_service.entry(service).or_insert(0) |= bits;
    }

    /// Add a command prefix allow-list.
    pub fn allow_command(&mut self, tokens: Vec<String>) {
        self.cmd_allow.push(tokens);
    }

    /// Check that every bit in `bits` is granted on `service`.
    pub fn check(&self, service: ServiceKind, bits: u8) -> bool {
        if self.allow_all {
            return true;
        }
        self.per_service
            .get(&service)
            .map(|granted| granted & bits == bits)
            .unwrap_or(false)
    }

    /// Match a command against the allow-lists.
    pub fn allows_command(&self, cmd: &[String]) -> bool {
        if self.allow_all {
            return true;
        }
        self.cmd_allow.iter().any(|pattern| {
            let mut i = 0;
            for tok in pattern {
                if tok == "..." {
                    return true;
                }
                match cmd.get(i) {
                    Some(c) if tok == "*" || tok == c => i += 1,
                    _ => return false,
                }
            }
            i == cmd.len()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn allow_all_passes_every_check() {
        let caps = CapabilityGrant::allow_all();
        assert!(caps.check(ServiceKind::MonMap, CAP_R | CAP_W | CAP_X));
        assert!(caps.allows_command(&cmd(&["anything", "at", "all"])));
    }

    #[test]
    fn empty_grant_denies_everything() {
        let caps = CapabilityGrant::default();
        assert!(!caps.check(ServiceKind::MonMap, CAP_R));
        assert!(!caps.allows_command(&cmd(&["mon_status"])));
    }

    #[test]
    fn service_bits_are_independent() {
        let mut caps = CapabilityGrant::default();
        caps.grant(ServiceKind::OsdMap, CAP_R);
        assert!(caps.check(ServiceKind::OsdMap, CAP_R));
        assert!(!caps.check(ServiceKind::OsdMap, CAP_R | CAP_W));
        assert!(!caps.check(ServiceKind::MdsMap, CAP_R));
    }

    #[test]
    fn exact_command_match() {
        let mut caps = CapabilityGrant::default();
        caps.allow_command(cmd(&["mon_status"]));
        assert!(caps.allows_command(&cmd(&["mon_status"])));
        assert!(!caps.allows_command(&cmd(&["mon_status", "extra"])));
        assert!(!caps.allows_command(&cmd(&["sync_force"])));
    }

    #[test]
    fn star_matches_exactly_one_token() {
        let mut caps = CapabilityGrant::default();
        caps.allow_command(cmd(&["osd", "*", "out"]));
        assert!(caps.allows_command(&cmd(&["osd", "3", "out"])));
        assert!(!caps.allows_command(&cmd(&["osd", "out"])));
        assert!(!caps.allows_command(&cmd(&["osd", "3", "4", "out"])));
    }

    #[test]
    fn ellipsis_matches_remainder() {
        let mut caps = CapabilityGrant::default();
        caps.allow_command(cmd(&["auth", "..."]));
        assert!(caps.allows_command(&cmd(&["auth"])));
        assert!(caps.allows_command(&cmd(&["auth", "add", "client.admin"])));
        assert!(!caps.allows_command(&cmd(&["osd", "auth"])));
    }

    #[test]
    fn first_matching_list_wins() {
        let mut caps = CapabilityGrant::default();
        caps.allow_command(cmd(&["pg", "stat"]));
        caps.allow_command(cmd(&["pg", "..."]));
        assert!(caps.allows_command(&cmd(&["pg", "dump", "all"])));
    }
}
