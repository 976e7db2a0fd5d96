/// Does a detected beacon belong to this session?
///
/// Only fields the session declares are compared. The identifier is always
/// compared, against the base beacon UUID when none is declared.
use crate::defaults::BEACON_SERVICE_UUID;
use crate::scanner::PresenceObservation;
use crate::session::SessionPolicy;

/// How to treat a session that pins neither an address nor a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Any beacon advertising the right identifier is accepted.
    #[default]
    Lenient,
    /// Refuse: the identifier alone is public and trivially spoofed.
    Strict,
}

/// First field that failed to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    Identifier,
    Address,
    EmbeddedToken,
    /// Strict mode and the session declares nothing beyond the identifier.
    Unpinned,
}

impl Mismatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mismatch::Identifier => "identifier",
            Mismatch::Address => "address",
            Mismatch::EmbeddedToken => "embedded_token",
            Mismatch::Unpinned => "unpinned",
        }
    }
}

/// A requirement set to the empty string is not declared.
fn declared<const N: usize>(field: &Option<heapless::String<N>>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

/// Compare every declared field; `Err` names the first mismatch.
pub fn check(
    observation: &PresenceObservation,
    policy: &SessionPolicy,
    mode: MatchMode,
) -> Result<(), Mismatch> {
    let expected_id = declared(&policy.expected_identifier).unwrap_or(BEACON_SERVICE_UUID);
    if !observation.identifier.eq_ignore_ascii_case(expected_id) {
        return Err(Mismatch::Identifier);
    }

    let address = declared(&policy.expected_address);
    if let Some(address) = address {
        if !observation.address.eq_ignore_ascii_case(address) {
            return Err(Mismatch::Address);
        }
    }

    let token = declared(&policy.expected_embedded_token);
    if let Some(token) = token {
        if observation.embedded_token.as_deref() != Some(token) {
            return Err(Mismatch::EmbeddedToken);
        }
    }

    if mode == MatchMode::Strict && address.is_none() && token.is_none() {
        return Err(Mismatch::Unpinned);
    }

    Ok(())
}

/// Whether `observation` is this session's beacon.
pub fn matches(observation: &PresenceObservation, policy: &SessionPolicy, mode: MatchMode) -> bool {
    match check(observation, policy, mode) {
        Ok(()) => true,
        Err(field) => {
            log::debug!("beacon {} rejected on {}", observation.address, field.as_str());
            false
        }
    }
}
