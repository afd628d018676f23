use serde::{Deserialize, Serialize};

use super::signer::ProofKey;

/// user.authenticate request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserAuthRequest {
    pub relying_party: String,
    pub token_type: String,
    pub properties: UserAuthProperties,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserAuthProperties {
    pub auth_method: String,
    pub site_name: String,
    pub rps_ticket: String,
}

/// device.authenticate request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceAuthRequest {
    pub relying_party: String,
    pub token_type: String,
    pub properties: DeviceAuthProperties,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceAuthProperties {
    pub auth_method: String,
    pub id: String,
    pub device_type: String,
    pub serial_number: String,
    pub version: String,
    pub proof_key: ProofKey,
}

/// title.authenticate request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TitleAuthRequest {
    pub relying_party: String,
    pub token_type: String,
    pub properties: TitleAuthProperties,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TitleAuthProperties {
    pub auth_method: String,
    pub device_token: String,
    pub rps_ticket: String,
    pub site_name: String,
    pub proof_key: ProofKey,
}

/// xsts/authorize request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthRequest {
    pub relying_party: String,
    pub token_type: String,
    pub properties: XstsAuthProperties,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthProperties {
    pub user_tokens: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional_display_claims: Option<Vec<String>>,
    pub proof_key: ProofKey,
    pub sandbox_id: String,
}

/// sisu.xboxlive.com/authorize request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SisuAuthRequest {
    pub access_token: String,
    pub app_id: String,
    pub device_token: String,
    pub sandbox: String,
    pub use_modern_gamertag: bool,
    pub site_name: String,
    pub relying_party: String,
    pub proof_key: ProofKey,
}

/// Token issued by any of the Xbox authentication endpoints
///
/// Stored verbatim in the cache so the display claims stay available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XboxTokenResponse {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_instant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
    #[serde(default)]
    pub display_claims: DisplayClaims,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayClaims {
    #[serde(default)]
    pub xui: Vec<UserClaims>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserClaims {
    #[serde(default)]
    pub uhs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SisuAuthResponse {
    pub user_token: XboxTokenResponse,
    pub title_token: XboxTokenResponse,
    pub authorization_token: XboxTokenResponse,
}

/// Body returned by xsts/authorize on a 401
#[derive(Debug, Clone, Deserialize)]
pub struct XErrResponse {
    #[serde(rename = "XErr")]
    pub xerr: u64,
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
}

/// Final product of the Xbox chain, cached per relying party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XstsToken {
    #[serde(rename = "userXUID")]
    pub user_xuid: Option<String>,
    #[serde(rename = "userHash")]
    pub user_hash: String,
    #[serde(rename = "XSTSToken")]
    pub xsts_token: String,
    #[serde(rename = "expiresOn")]
    pub expires_on: String,
}

impl XstsToken {
    /// `Authorization` value expected by downstream services
    pub fn authorization_header(&self) -> String {
        format!("XBL3.0 x={};{}", self.user_hash, self.xsts_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_xbox_token_response_parsing() {
        let response: XboxTokenResponse = serde_json::from_value(json!({
            "IssueInstant": "2024-01-01T00:00:00.0000000Z",
            "NotAfter": "2024-01-15T00:00:00.0000000Z",
            "Token": "ut",
            "DisplayClaims": { "xui": [{ "uhs": "1234" }] }
        }))
        .unwrap();
        assert_eq!(response.token, "ut");
        assert_eq!(response.display_claims.xui[0].uhs, "1234");
        assert_eq!(response.display_claims.xui[0].xid, None);
    }

    #[test]
    fn test_device_token_without_claims() {
        let body = json!({ "Token": "dt", "NotAfter": "2024-01-15T00:00:00Z" });
        let response: XboxTokenResponse = serde_json::from_value(body).unwrap();
        assert!(response.display_claims.xui.is_empty());
    }

    #[test]
    fn test_xsts_token_cache_shape() {
        let token = XstsToken {
            user_xuid: Some("2535".into()),
            user_hash: "uhs".into(),
            xsts_token: "xsts".into(),
            expires_on: "2024-01-15T00:00:00Z".into(),
        };
        let value = serde_json::to_value(&token).unwrap();
        assert_eq!(value["userHash"], "uhs");
        assert_eq!(value["XSTSToken"], "xsts");
        assert_eq!(token.authorization_header(), "XBL3.0 x=uhs;xsts");
    }

    #[test]
    fn test_xsts_request_omits_absent_tokens() {
        let request = XstsAuthRequest {
            relying_party: "rp".into(),
            token_type: "JWT".into(),
            properties: XstsAuthProperties {
                user_tokens: vec!["ut".into()],
                device_token: None,
                title_token: None,
                optional_display_claims: None,
                proof_key: ProofKey {
                    kty: "EC".into(),
                    crv: "P-256".into(),
                    x: "x".into(),
                    y: "y".into(),
                    alg: "ES256".into(),
                    key_use: "sig".into(),
                },
                sandbox_id: "RETAIL".into(),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["RelyingParty"], "rp");
        assert_eq!(value["Properties"]["UserTokens"][0], "ut");
        assert!(value["Properties"].get("DeviceToken").is_none());
        assert_eq!(value["Properties"]["ProofKey"]["use"], "sig");
    }
}
