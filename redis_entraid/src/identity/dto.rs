//! DTOs for the Entra ID token endpoints

use entraid_tokens::AccessTokenRef;
use serde::Deserialize;

/// A count of seconds, which managed-identity endpoints send as a string
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum Seconds {
    Number(u64),
    Text(#[serde(deserialize_with = "seconds_from_str")] u64),
}

impl Seconds {
    pub(super) fn get(self) -> u64 {
        match self {
            Self::Number(s) | Self::Text(s) => s,
        }
    }
}

fn seconds_from_str<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.trim().parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse<'a> {
    #[serde(borrow)]
    pub access_token: &'a AccessTokenRef,
    /// Lifetime relative to issuance
    #[serde(default)]
    pub expires_in: Option<Seconds>,
    /// Absolute expiry as Unix seconds
    #[serde(default)]
    pub expires_on: Option<Seconds>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    /// App Service reports failures as `{"statusCode": …, "message": …}`
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorResponse {
    pub(super) fn description(&self) -> Option<&str> {
        self.error_description
            .as_deref()
            .or(self.message.as_deref())
            .or(self.error.as_deref())
    }
}

/// The output of `az account get-access-token`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CliTokenResponse {
    pub access_token: String,
    /// Absolute expiry as Unix seconds, reported by newer CLI versions
    #[serde(default, rename = "expires_on")]
    pub expires_on: Option<Seconds>,
}
