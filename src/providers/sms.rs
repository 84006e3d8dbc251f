//! Template SMS through Aliyun, Tencent Cloud and Huawei Cloud.
//!
//! The account subtype picks the vendor and with it the signature scheme:
//!
//! | Subtype   | Credentials                                   | Signing            |
//! |-----------|-----------------------------------------------|--------------------|
//! | `aliyun`  | access key id / secret                        | ACS3-HMAC-SHA256   |
//! | `tencent` | secret id / key, `app_id` = SdkAppId           | TC3-HMAC-SHA256    |
//! | `huawei`  | app key / secret, `app_id` = sender channel   | WSSE UsernameToken |
//!
//! Template parameters are kept in order. Aliyun receives them as a JSON
//! object, the other vendors as a positional list of values.

use super::signing;
use crate::context::SendContext;
use crate::errors::{ConfigurationError, SenderError, SenderResult};
use crate::provider::{HttpProvider, ProviderConfig};
use crate::response::ResponseHandlerConfig;
use crate::transformer::{HttpRequestSpec, TransformOutput, Transformer, TransformerRegistry};
use crate::transport::{BodyType, HttpTransport};
use crate::types::message::{require, require_any};
use crate::types::{downcast_message, new_message_id, BaseAccount, Credentials, Message, ProviderType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const ALIYUN_ENDPOINT: &str = "https://dysmsapi.aliyuncs.com";
const ALIYUN_VERSION: &str = "2017-05-25";
const TENCENT_ENDPOINT: &str = "https://sms.tencentcloudapi.com";
const TENCENT_VERSION: &str = "2021-01-11";
const TENCENT_REGION: &str = "ap-guangzhou";
const JSON_UTF8: &str = "application/json; charset=utf-8";

/// SMS vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmsVendor {
    /// Aliyun Dysms
    Aliyun,
    /// Tencent Cloud SMS
    Tencent,
    /// Huawei Cloud Message & SMS
    Huawei,
}

impl SmsVendor {
    /// Subtype string
    pub fn as_str(self) -> &'static str {
        match self {
            SmsVendor::Aliyun => "aliyun",
            SmsVendor::Tencent => "tencent",
            SmsVendor::Huawei => "huawei",
        }
    }

    /// Parse a subtype string
    pub fn parse(sub_type: &str) -> Option<Self> {
        match sub_type {
            "aliyun" => Some(SmsVendor::Aliyun),
            "tencent" => Some(SmsVendor::Tencent),
            "huawei" => Some(SmsVendor::Huawei),
            _ => None,
        }
    }
}

impl fmt::Display for SmsVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SMS gateway account
#[derive(Debug, Clone, Deserialize)]
pub struct SmsAccount {
    /// Shared account fields; the subtype names the vendor
    #[serde(flatten)]
    pub base: BaseAccount,
    /// Default signature name
    #[serde(default)]
    pub sign_name: String,
    /// Vendor region
    #[serde(default)]
    pub region: Option<String>,
    /// Overrides the vendor endpoint; required for Huawei
    #[serde(default)]
    pub endpoint: Option<String>,
}

crate::impl_selectable!(SmsAccount);

impl SmsAccount {
    /// Account for a vendor
    pub fn new(
        name: impl Into<String>,
        vendor: SmsVendor,
        access_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            base: BaseAccount::new(name)
                .with_sub_type(vendor.as_str())
                .with_credentials(Credentials::new(access_key, secret)),
            sign_name: String::new(),
            region: None,
            endpoint: None,
        }
    }

    /// Set the default signature name
    pub fn with_sign_name(mut self, sign_name: impl Into<String>) -> Self {
        self.sign_name = sign_name.into();
        self
    }

    /// Set the SdkAppId (Tencent) or sender channel (Huawei)
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.base.credentials.app_id = app_id.into();
        self
    }

    /// Set the region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Use another endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Vendor named by the subtype
    pub fn vendor(&self) -> Option<SmsVendor> {
        self.base.sub_type.as_deref().and_then(SmsVendor::parse)
    }

    /// Check the fields the vendor requires
    pub fn validate(&self) -> SenderResult<()> {
        let vendor = self.vendor().ok_or_else(|| {
            SenderError::Configuration(ConfigurationError::InvalidValue {
                field: format!("sms.{}.sub_type", self.base.name),
                message: "expected aliyun, tencent or huawei".to_string(),
            })
        })?;

        let credentials = &self.base.credentials;
        self.require_field(&credentials.api_key, "api_key")?;
        self.require_field(credentials.secret(), "api_secret")?;
        match vendor {
            SmsVendor::Aliyun => self.require_field(&self.sign_name, "sign_name"),
            SmsVendor::Tencent => {
                self.require_field(&self.sign_name, "sign_name")?;
                self.require_field(&credentials.app_id, "app_id")
            }
            SmsVendor::Huawei => {
                self.require_field(&credentials.app_id, "app_id")?;
                self.require_field(self.endpoint.as_deref().unwrap_or(""), "endpoint")
            }
        }
    }

    fn require_field(&self, value: &str, field: &str) -> SenderResult<()> {
        if value.trim().is_empty() {
            return Err(SenderError::Configuration(ConfigurationError::MissingField {
                field: format!("sms.{}.{}", self.base.name, field),
            }));
        }
        Ok(())
    }

    fn endpoint_or(&self, default: &str) -> String {
        self.endpoint
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }
}

/// Template SMS
#[derive(Debug, Clone)]
pub struct SmsMessage {
    id: String,
    /// Target vendor
    pub vendor: SmsVendor,
    /// Recipient numbers
    pub mobiles: Vec<String>,
    /// Template code or id
    pub template_id: String,
    /// Ordered template parameters
    pub params: Vec<(String, String)>,
    /// Overrides the account's signature name
    pub sign_name: Option<String>,
}

impl SmsMessage {
    /// Template message for a vendor
    pub fn new(vendor: SmsVendor, template_id: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            vendor,
            mobiles: Vec::new(),
            template_id: template_id.into(),
            params: Vec::new(),
            sign_name: None,
        }
    }

    /// Aliyun template message
    pub fn aliyun(template_code: impl Into<String>) -> Self {
        Self::new(SmsVendor::Aliyun, template_code)
    }

    /// Tencent template message
    pub fn tencent(template_id: impl Into<String>) -> Self {
        Self::new(SmsVendor::Tencent, template_id)
    }

    /// Huawei template message
    pub fn huawei(template_id: impl Into<String>) -> Self {
        Self::new(SmsVendor::Huawei, template_id)
    }

    /// Add a recipient
    pub fn to(mut self, mobile: impl Into<String>) -> Self {
        self.mobiles.push(mobile.into());
        self
    }

    /// Add a template parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Override the signature name
    pub fn sign_name(mut self, sign_name: impl Into<String>) -> Self {
        self.sign_name = Some(sign_name.into());
        self
    }

    fn signature<'a>(&'a self, account: &'a SmsAccount) -> &'a str {
        self.sign_name.as_deref().unwrap_or(&account.sign_name)
    }

    fn param_values(&self) -> Vec<&str> {
        self.params.iter().map(|(_, v)| v.as_str()).collect()
    }
}

impl Message for SmsMessage {
    fn provider_type(&self) -> ProviderType {
        ProviderType::SMS
    }

    fn sub_type(&self) -> Option<&str> {
        Some(self.vendor.as_str())
    }

    fn validate(&self) -> SenderResult<()> {
        require_any(&self.mobiles, "mobile")?;
        for mobile in &self.mobiles {
            require(mobile, "mobile")?;
        }
        require(&self.template_id, "template_id")
    }

    fn msg_id(&self) -> &str {
        &self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn utc_iso8601(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Sorted, percent-encoded query string used by ACS3 signing
pub fn aliyun_canonical_query(params: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// ACS3-HMAC-SHA256 `Authorization` value.
///
/// `headers` must already be lowercase and include every `x-acs-*` header
/// plus `host`; they are sorted here.
pub fn aliyun_authorization(
    access_key: &str,
    secret: &str,
    method: &str,
    canonical_query: &str,
    headers: &[(&str, String)],
    payload_hash: &str,
) -> SenderResult<String> {
    let mut headers: Vec<&(&str, String)> = headers.iter().collect();
    headers.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers = headers.iter().map(|(k, _)| *k).collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n/\n{}\n{}\n{}\n{}",
        method, canonical_query, canonical_headers, signed_headers, payload_hash
    );
    let string_to_sign = format!(
        "ACS3-HMAC-SHA256\n{}",
        signing::sha256_hex(canonical_request.as_bytes())
    );
    let signature = hex::encode(signing::hmac_sha256(
        secret.as_bytes(),
        string_to_sign.as_bytes(),
    )?);

    Ok(format!(
        "ACS3-HMAC-SHA256 Credential={},SignedHeaders={},Signature={}",
        access_key, signed_headers, signature
    ))
}

/// TC3-HMAC-SHA256 `Authorization` value for a JSON POST
pub fn tencent_authorization(
    secret_id: &str,
    secret_key: &str,
    service: &str,
    host: &str,
    timestamp: i64,
    payload: &[u8],
) -> SenderResult<String> {
    let date = DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| SenderError::transform(format!("invalid timestamp {}", timestamp)))?
        .format("%Y-%m-%d")
        .to_string();

    let canonical_request = format!(
        "POST\n/\n\ncontent-type:{}\nhost:{}\n\ncontent-type;host\n{}",
        JSON_UTF8,
        host,
        signing::sha256_hex(payload)
    );
    let scope = format!("{}/{}/tc3_request", date, service);
    let string_to_sign = format!(
        "TC3-HMAC-SHA256\n{}\n{}\n{}",
        timestamp,
        scope,
        signing::sha256_hex(canonical_request.as_bytes())
    );

    let secret_date = signing::hmac_sha256(format!("TC3{}", secret_key).as_bytes(), date.as_bytes())?;
    let secret_service = signing::hmac_sha256(&secret_date, service.as_bytes())?;
    let secret_signing = signing::hmac_sha256(&secret_service, b"tc3_request")?;
    let signature = hex::encode(signing::hmac_sha256(
        &secret_signing,
        string_to_sign.as_bytes(),
    )?);

    Ok(format!(
        "TC3-HMAC-SHA256 Credential={}/{}, SignedHeaders=content-type;host, Signature={}",
        secret_id, scope, signature
    ))
}

/// Huawei `X-WSSE` header value
pub fn huawei_wsse(app_key: &str, app_secret: &str, nonce: &str, created: &str) -> String {
    let digest = signing::sha256(format!("{}{}{}", nonce, created, app_secret).as_bytes());
    format!(
        "UsernameToken Username=\"{}\",PasswordDigest=\"{}\",Nonce=\"{}\",Created=\"{}\"",
        app_key,
        signing::base64(&digest),
        nonce,
        created
    )
}

fn account_for<'a>(account: &'a SmsAccount, vendor: SmsVendor) -> SenderResult<&'a SmsAccount> {
    if account.vendor() != Some(vendor) {
        return Err(SenderError::transform(format!(
            "account {} does not serve {}",
            account.base.name, vendor
        )));
    }
    Ok(account)
}

/// Aliyun `SendSms`
#[derive(Debug, Default)]
pub struct AliyunTransformer;

#[async_trait]
impl Transformer<SmsAccount> for AliyunTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::SMS
    }

    fn sub_type(&self) -> &str {
        SmsVendor::Aliyun.as_str()
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &SmsAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<SmsMessage>(msg)?;
        let account = account_for(account, SmsVendor::Aliyun)?;
        let credentials = &account.base.credentials;

        let template_param: Map<String, Value> = msg
            .params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let mut params = vec![
            ("PhoneNumbers".to_string(), msg.mobiles.join(",")),
            ("SignName".to_string(), msg.signature(account).to_string()),
            ("TemplateCode".to_string(), msg.template_id.clone()),
        ];
        if !template_param.is_empty() {
            params.push((
                "TemplateParam".to_string(),
                Value::Object(template_param).to_string(),
            ));
        }

        let endpoint = account.endpoint_or(ALIYUN_ENDPOINT);
        let query = aliyun_canonical_query(&params);
        let payload_hash = signing::sha256_hex(b"");
        let headers = vec![
            ("host", signing::host_of(&endpoint)?),
            ("x-acs-action", "SendSms".to_string()),
            ("x-acs-content-sha256", payload_hash.clone()),
            ("x-acs-date", utc_iso8601(Utc::now())),
            ("x-acs-signature-nonce", signing::nonce()),
            ("x-acs-version", ALIYUN_VERSION.to_string()),
        ];
        let authorization = aliyun_authorization(
            &credentials.api_key,
            credentials.secret(),
            "POST",
            &query,
            &headers,
            &payload_hash,
        )?;

        // Query is pre-encoded so the server sees exactly what was signed
        let mut spec = HttpRequestSpec::new(Method::POST, format!("{}/?{}", endpoint, query));
        for (name, value) in &headers {
            if *name != "host" {
                spec = spec.header(*name, value)?;
            }
        }
        spec = spec.header("authorization", &authorization)?;

        debug!(account = %account.base.name, recipients = msg.mobiles.len(), "Built Aliyun SMS request");
        Ok(TransformOutput::new(spec))
    }

    fn response_config(&self) -> ResponseHandlerConfig {
        ResponseHandlerConfig::json_eq("Code", "OK").with_error_paths("Code", "Message")
    }
}

/// Tencent Cloud `SendSms`
#[derive(Debug, Default)]
pub struct TencentTransformer;

#[async_trait]
impl Transformer<SmsAccount> for TencentTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::SMS
    }

    fn sub_type(&self) -> &str {
        SmsVendor::Tencent.as_str()
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &SmsAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<SmsMessage>(msg)?;
        let account = account_for(account, SmsVendor::Tencent)?;
        let credentials = &account.base.credentials;

        let body = json!({
            "PhoneNumberSet": msg.mobiles,
            "SmsSdkAppId": credentials.app_id,
            "SignName": msg.signature(account),
            "TemplateId": msg.template_id,
            "TemplateParamSet": msg.param_values(),
        });
        let payload = serde_json::to_vec(&body)
            .map_err(|e| SenderError::transform(format!("failed to encode body: {}", e)))?;

        let endpoint = account.endpoint_or(TENCENT_ENDPOINT);
        let host = signing::host_of(&endpoint)?;
        let timestamp = Utc::now().timestamp();
        let authorization = tencent_authorization(
            &credentials.api_key,
            credentials.secret(),
            "sms",
            &host,
            timestamp,
            &payload,
        )?;

        let spec = HttpRequestSpec::new(Method::POST, endpoint)
            .with_body(BodyType::Json, payload)
            .header("content-type", JSON_UTF8)?
            .header("authorization", &authorization)?
            .header("x-tc-action", "SendSms")?
            .header("x-tc-timestamp", &timestamp.to_string())?
            .header("x-tc-version", TENCENT_VERSION)?
            .header("x-tc-region", account.region.as_deref().unwrap_or(TENCENT_REGION))?;

        debug!(account = %account.base.name, recipients = msg.mobiles.len(), "Built Tencent SMS request");
        Ok(TransformOutput::new(spec))
    }

    fn response_config(&self) -> ResponseHandlerConfig {
        ResponseHandlerConfig::json_eq("Response.SendStatusSet.0.Code", "Ok")
            .with_error_paths("Response.Error.Code", "Response.Error.Message")
    }
}

/// Huawei Cloud `batchSendSms`
#[derive(Debug, Default)]
pub struct HuaweiTransformer;

#[async_trait]
impl Transformer<SmsAccount> for HuaweiTransformer {
    fn provider_type(&self) -> ProviderType {
        ProviderType::SMS
    }

    fn sub_type(&self) -> &str {
        SmsVendor::Huawei.as_str()
    }

    async fn transform(
        &self,
        _ctx: &SendContext,
        msg: &dyn Message,
        account: &SmsAccount,
    ) -> SenderResult<TransformOutput> {
        let msg = downcast_message::<SmsMessage>(msg)?;
        let account = account_for(account, SmsVendor::Huawei)?;
        let credentials = &account.base.credentials;
        let endpoint = account
            .endpoint
            .as_deref()
            .ok_or_else(|| SenderError::transform("huawei account has no endpoint"))?
            .trim_end_matches('/');

        let params = serde_json::to_string(&msg.param_values())
            .map_err(|e| SenderError::transform(format!("failed to encode params: {}", e)))?;
        let mut fields = vec![
            ("from".to_string(), credentials.app_id.clone()),
            ("to".to_string(), msg.mobiles.join(",")),
            ("templateId".to_string(), msg.template_id.clone()),
            ("templateParas".to_string(), params),
        ];
        let signature = msg.signature(account);
        if !signature.is_empty() {
            fields.push(("signature".to_string(), signature.to_string()));
        }

        let wsse = huawei_wsse(
            &credentials.api_key,
            credentials.secret(),
            &signing::nonce(),
            &utc_iso8601(Utc::now()),
        );
        let spec = HttpRequestSpec::post_form(format!("{}/sms/batchSendSms/v1", endpoint), &fields)
            .header(
                "authorization",
                r#"WSSE realm="SDP",profile="UsernameToken",type="Appkey""#,
            )?
            .header("x-wsse", &wsse)?;

        debug!(account = %account.base.name, recipients = msg.mobiles.len(), "Built Huawei SMS request");
        Ok(TransformOutput::new(spec))
    }

    fn response_config(&self) -> ResponseHandlerConfig {
        ResponseHandlerConfig::json_eq("code", "000000").with_error_paths("code", "description")
    }
}

/// Transformers for every SMS vendor
pub fn transformers() -> TransformerRegistry<SmsAccount> {
    TransformerRegistry::new()
        .with(Arc::new(AliyunTransformer))
        .with(Arc::new(TencentTransformer))
        .with(Arc::new(HuaweiTransformer))
}

/// Build an SMS provider
pub fn provider(
    config: ProviderConfig<SmsAccount>,
    transport: Arc<dyn HttpTransport>,
) -> SenderResult<HttpProvider<SmsAccount>> {
    for account in &config.items {
        account.validate()?;
    }
    HttpProvider::new(ProviderType::SMS, config, Arc::new(transformers()), transport)
}
