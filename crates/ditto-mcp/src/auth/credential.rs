use std::fmt;

use serde::{Deserialize, Serialize};

/// The OAuth credential as stored in `tokens.json`.
///
/// Refresh responses reuse this type: fields the token endpoint did not return
/// are `None` and are filled from the previous record by [`merge_credential`].
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Absolute expiry of the access token, milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
}

impl Credential {
    /// True when the access token is missing or expires within `threshold_ms` of `now_ms`.
    /// A credential without a known expiry is treated as valid.
    pub fn needs_refresh(&self, now_ms: i64, threshold_ms: i64) -> bool {
        if self.access_token.is_none() {
            return true;
        }
        self.expiry_date
            .is_some_and(|expiry| expiry <= now_ms.saturating_add(threshold_ms))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .field("expiry_date", &self.expiry_date)
            .finish()
    }
}

/// Field-by-field merge: values from `refreshed` win, `previous` fills the gaps.
///
/// Applying the same `refreshed` twice yields the same record.
pub fn merge_credential(previous: &Credential, refreshed: &Credential) -> Credential {
    Credential {
        access_token: refreshed
            .access_token
            .clone()
            .or_else(|| previous.access_token.clone()),
        refresh_token: refreshed
            .refresh_token
            .clone()
            .or_else(|| previous.refresh_token.clone()),
        scope: refreshed.scope.clone().or_else(|| previous.scope.clone()),
        token_type: refreshed
            .token_type
            .clone()
            .or_else(|| previous.token_type.clone()),
        expiry_date: refreshed.expiry_date.or(previous.expiry_date),
    }
}
