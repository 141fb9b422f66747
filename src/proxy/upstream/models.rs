use serde::{Deserialize, Serialize};

/// Session block attached to every game request.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserAuthBlock {
    pub uid: i64,
    pub dbid: i64,
    pub auth_code: String,
    pub version: String,
    pub synchronous_data_version: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRequest<P: Serialize> {
    pub user_auth: UserAuthBlock,
    pub parameters: P,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BaseResponse {
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionAuth {
    pub uid: i64,
    #[serde(default, alias = "publicId")]
    pub public_id: Option<i64>,
    #[serde(default, alias = "dbId")]
    pub db_id: Option<i64>,
    #[serde(alias = "authCode")]
    pub auth_code: String,
    #[serde(default, alias = "lastLoginDate")]
    pub last_login_date: Option<String>,
    #[serde(default, alias = "dataVersion")]
    pub data_version: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    pub uid: i64,
    #[serde(default, alias = "steamAccount")]
    pub steam_account: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInResult {
    pub user_auth: SessionAuth,
    #[serde(default)]
    pub account_info: Option<AccountInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignInResponse {
    pub state: String,
    pub result: SignInResult,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub uid: i64,
    pub level: i64,
    #[serde(default)]
    pub exp: i64,
    pub stamina: i64,
    #[serde(default)]
    pub last_stamina_recover: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mail {
    pub mail_id: i64,
    #[serde(default)]
    pub sent_date: Option<String>,
    #[serde(default)]
    pub expiry_date: Option<String>,
    #[serde(default)]
    pub content_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Updated {
    pub user_info: UserInfo,
    #[serde(default)]
    pub mail_list: Vec<Mail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub public_uid: String,
    pub level: i64,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadAllResult {
    pub profile: Profile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadAllResponse {
    pub state: String,
    pub updated: Updated,
    pub result: LoadAllResult,
}
