// 上传凭证
//
// 凭证由业务服务端下发是推荐做法；本模块用于开发与测试环境在
// 本地生成凭证：对 URL 安全 base64 编码的策略 JSON 做 HMAC-SHA1
// 签名，拼成 AK:签名:编码策略 三段。

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::Duration;

type HmacSha1 = Hmac<Sha1>;

/// 上传策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPolicy {
    /// 资源范围："bucket" 或 "bucket:key"
    pub scope: String,
    /// 凭证过期时间（Unix 时间戳，秒）
    pub deadline: u64,
    /// 为 1 时仅允许新增，不允许覆盖同名对象
    #[serde(rename = "insertOnly", skip_serializing_if = "Option::is_none")]
    pub insert_only: Option<u32>,
    /// 自定义响应体模板
    #[serde(rename = "returnBody", skip_serializing_if = "Option::is_none")]
    pub return_body: Option<String>,
    /// 文件大小上限（字节）
    #[serde(rename = "fsizeLimit", skip_serializing_if = "Option::is_none")]
    pub fsize_limit: Option<u64>,
    /// MIME 类型限制
    #[serde(rename = "mimeLimit", skip_serializing_if = "Option::is_none")]
    pub mime_limit: Option<String>,
}

impl UploadPolicy {
    /// 创建指定有效期的上传策略；key 为 None 时作用于整个空间
    pub fn new(bucket: &str, key: Option<&str>, ttl: Duration) -> Self {
        let scope = match key {
            Some(key) => format!("{}:{}", bucket, key),
            None => bucket.to_string(),
        };
        let deadline = Utc::now().timestamp() as u64 + ttl.as_secs();
        Self {
            scope,
            deadline,
            insert_only: None,
            return_body: None,
            fsize_limit: None,
            mime_limit: None,
        }
    }
}

/// 生成上传凭证
///
/// 格式：`AK:URL安全Base64(HMAC-SHA1(SK, 编码策略)):URL安全Base64(策略JSON)`
pub fn sign_upload_token(access_key: &str, secret_key: &str, policy: &UploadPolicy) -> String {
    let policy_json = serde_json::to_string(policy).expect("纯数据结构序列化不会失败");
    let encoded_policy = URL_SAFE.encode(policy_json.as_bytes());
    let mut mac =
        HmacSha1::new_from_slice(secret_key.as_bytes()).expect("HMAC 接受任意长度的密钥");
    mac.update(encoded_policy.as_bytes());
    let sign = URL_SAFE.encode(mac.finalize().into_bytes());
    format!("{}:{}:{}", access_key, sign, encoded_policy)
}
