//! Providers: account selection plus the transform-send-interpret pipeline.

use crate::context::{SendContext, SendOptions};
use crate::errors::{ConfigurationError, SenderError, SenderResult};
use crate::observability::{AccountHealth, ComponentHealth, HealthStatus};
use crate::response::interpret;
use crate::strategy::{HealthFiltered, SelectionStrategy, StrategyKind};
use crate::transformer::TransformerRegistry;
use crate::transport::{self, HttpTransport};
use crate::types::{Message, ProviderType, Selectable, SendResult};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// A registered delivery channel
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name, used in errors and metrics
    fn name(&self) -> &str;

    /// Provider family served
    fn provider_type(&self) -> ProviderType;

    /// Deliver one message
    async fn send(
        &self,
        ctx: &SendContext,
        msg: &dyn Message,
        opts: &SendOptions,
    ) -> SenderResult<SendResult>;

    /// Health report; `None` when the provider cannot check itself
    async fn health_check(&self, _ctx: &SendContext) -> Option<ComponentHealth> {
        None
    }

    /// Release resources
    async fn close(&self) -> SenderResult<()> {
        Ok(())
    }
}

/// Accounts for one provider family
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig<A> {
    /// Disable the whole provider
    #[serde(default)]
    pub disabled: bool,
    /// Default selection strategy
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Accounts
    #[serde(default)]
    pub items: Vec<A>,
}

impl<A> ProviderConfig<A> {
    /// Round-robin over the given accounts
    pub fn new(items: Vec<A>) -> Self {
        Self {
            disabled: false,
            strategy: StrategyKind::RoundRobin,
            items,
        }
    }

    /// Set the strategy
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Disable the provider
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// Chooses an account per send
#[derive(Debug)]
pub struct AccountSelector<A: Selectable> {
    provider: String,
    accounts: Vec<Arc<A>>,
    strategy: Arc<dyn SelectionStrategy>,
    health: Arc<AccountHealth>,
}

impl<A: Selectable> AccountSelector<A> {
    /// Validate a config and keep its enabled accounts
    pub fn new(provider: impl Into<String>, config: ProviderConfig<A>) -> SenderResult<Self> {
        let provider = provider.into();
        if config.disabled {
            return Err(ConfigurationError::ProviderDisabled { provider }.into());
        }
        if config.items.is_empty() {
            return Err(ConfigurationError::NoItems { provider }.into());
        }

        let mut seen = HashSet::new();
        for item in &config.items {
            if !seen.insert(item.name().to_string()) {
                return Err(ConfigurationError::DuplicateAccount {
                    provider,
                    name: item.name().to_string(),
                }
                .into());
            }
        }

        let accounts: Vec<Arc<A>> = config
            .items
            .into_iter()
            .filter(|a| a.is_enabled())
            .map(Arc::new)
            .collect();
        if accounts.is_empty() {
            return Err(ConfigurationError::AllItemsDisabled { provider }.into());
        }

        let health = Arc::new(AccountHealth::new());
        let strategy = Arc::new(HealthFiltered::new(config.strategy.build(), health.clone()));

        Ok(Self {
            provider,
            accounts,
            strategy,
            health,
        })
    }

    /// Enabled accounts
    pub fn accounts(&self) -> &[Arc<A>] {
        &self.accounts
    }

    /// Per-account health tracker
    pub fn health(&self) -> &Arc<AccountHealth> {
        &self.health
    }

    /// Pick an account: pinned name, then subtype filter, then strategy
    pub fn select(&self, ctx: &SendContext, msg: &dyn Message) -> SenderResult<Arc<A>> {
        if let Some(name) = ctx.route().account_name.as_deref() {
            return self
                .accounts
                .iter()
                .find(|a| a.name() == name)
                .cloned()
                .ok_or_else(|| SenderError::NoAccount {
                    provider: self.provider.clone(),
                    reason: format!("account {} not found or disabled", name),
                });
        }

        let candidates: Vec<&Arc<A>> = self
            .accounts
            .iter()
            .filter(|a| match msg.sub_type() {
                Some(sub) => a.sub_type() == Some(sub),
                None => true,
            })
            .collect();
        if candidates.is_empty() {
            return Err(SenderError::NoAccount {
                provider: self.provider.clone(),
                reason: format!(
                    "no enabled account for subtype {}",
                    msg.sub_type().unwrap_or("*")
                ),
            });
        }

        let refs: Vec<&dyn Selectable> = candidates.iter().map(|a| a.as_ref() as &dyn Selectable).collect();
        let index = match ctx.route().strategy {
            Some(kind) => HealthFiltered::new(kind.build(), self.health.clone()).select(&refs),
            None => self.strategy.select(&refs),
        };

        index
            .map(|i| candidates[i].clone())
            .ok_or_else(|| SenderError::NoAccount {
                provider: self.provider.clone(),
                reason: "selection strategy returned no account".to_string(),
            })
    }

    /// Feed a send outcome into account health
    pub fn observe(&self, account: &str, result: &SenderResult<SendResult>) {
        let status = match result {
            Ok(_) => HealthStatus::Healthy,
            Err(SenderError::Network(_)) => HealthStatus::Unhealthy,
            Err(SenderError::Http { status, .. }) if *status >= 500 => HealthStatus::Unhealthy,
            Err(SenderError::Auth(_)) => HealthStatus::Degraded,
            Err(_) => return,
        };
        self.health.mark(account, status);
    }

    /// Provider-level health from account health
    pub fn health_report(&self) -> ComponentHealth {
        match self.health.summary(self.accounts.len()) {
            HealthStatus::Healthy => ComponentHealth::healthy(&self.provider),
            status => ComponentHealth::with_status(
                &self.provider,
                status,
                "one or more accounts failing",
            ),
        }
    }
}

/// Generic HTTP provider driven by a transformer registry
pub struct HttpProvider<A: Selectable> {
    name: String,
    provider_type: ProviderType,
    selector: AccountSelector<A>,
    transformers: Arc<TransformerRegistry<A>>,
    transport: Arc<dyn HttpTransport>,
}

impl<A: Selectable> HttpProvider<A> {
    /// Create a provider.
    ///
    /// Fails if the config is disabled, empty, or has no enabled account.
    pub fn new(
        provider_type: ProviderType,
        config: ProviderConfig<A>,
        transformers: Arc<TransformerRegistry<A>>,
        transport: Arc<dyn HttpTransport>,
    ) -> SenderResult<Self> {
        let name = provider_type.to_string();
        Ok(Self {
            selector: AccountSelector::new(name.clone(), config)?,
            name,
            provider_type,
            transformers,
            transport,
        })
    }

    /// Account selector
    pub fn selector(&self) -> &AccountSelector<A> {
        &self.selector
    }

    async fn deliver(
        &self,
        ctx: &SendContext,
        msg: &dyn Message,
        opts: &SendOptions,
        account: &A,
    ) -> SenderResult<SendResult> {
        if !account.is_enabled() {
            return Err(SenderError::AccountDisabled {
                name: account.name().to_string(),
            });
        }

        let transformer = self.transformers.resolve(msg)?;
        let output = transformer.transform(ctx, msg, account).await?;
        let mut spec = output.spec;

        let transport = opts
            .http_client
            .clone()
            .unwrap_or_else(|| self.transport.clone());
        transformer
            .authorize(ctx, account, &mut spec, &transport)
            .await?;

        let url = spec.url.clone();
        let start = Instant::now();
        let response = transport::send(ctx, &url, spec.into_options(), &transport).await?;
        let duration = start.elapsed();

        debug!(
            provider = %self.name,
            account = account.name(),
            status = response.status,
            duration_ms = duration.as_millis() as u64,
            "Vendor responded"
        );

        let verdict = match &output.handler {
            Some(handler) => handler(response.status, &response.headers, &response.body),
            None => interpret(
                &transformer.response_config(),
                response.status,
                &response.headers,
                &response.body,
            ),
        };

        if let Err(SenderError::ProviderApi(api)) = &verdict {
            if transformer.auth_error_codes().contains(&api.code.as_str()) {
                warn!(provider = %self.name, account = account.name(), code = %api.code, "Credential rejected");
                transformer.on_auth_error(account).await;
                return Err(SenderError::Auth(api.clone().retryable(true)));
            }
        }
        verdict?;

        Ok(SendResult {
            success: true,
            message_id: msg.msg_id().to_string(),
            provider: self.name.clone(),
            account_name: account.name().to_string(),
            status_code: response.status,
            body: response.body,
            headers: response.headers,
            metadata: opts.metadata.clone(),
            timestamp: Utc::now(),
            duration,
        })
    }
}

#[async_trait]
impl<A: Selectable> Provider for HttpProvider<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        self.provider_type.clone()
    }

    #[instrument(skip(self, ctx, msg, opts), fields(provider = %self.name, msg_id = msg.msg_id()))]
    async fn send(
        &self,
        ctx: &SendContext,
        msg: &dyn Message,
        opts: &SendOptions,
    ) -> SenderResult<SendResult> {
        let account = self.selector.select(ctx, msg)?;
        let mut result = self.deliver(ctx, msg, opts, &account).await;

        // Cached credentials were dropped by the transformer; one more
        // attempt picks up a fresh token. A second rejection is final.
        if let Err(SenderError::Auth(_)) = &result {
            debug!(provider = %self.name, account = account.name(), "Retrying with refreshed credentials");
            result = match self.deliver(ctx, msg, opts, &account).await {
                Err(SenderError::Auth(api)) => Err(SenderError::Auth(api.retryable(false))),
                other => other,
            };
        }

        self.selector.observe(account.name(), &result);
        result
    }

    async fn health_check(&self, _ctx: &SendContext) -> Option<ComponentHealth> {
        Some(self.selector.health_report())
    }
}

impl<A: Selectable> fmt::Debug for HttpProvider<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProvider")
            .field("name", &self.name)
            .field("accounts", &self.selector.accounts().len())
            .field("transformers", &self.transformers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::TestMessage;
    use crate::types::BaseAccount;

    fn config(names: &[&str]) -> ProviderConfig<BaseAccount> {
        ProviderConfig::new(names.iter().map(|n| BaseAccount::new(*n)).collect())
    }

    #[test]
    fn test_construction_failures() {
        let err = AccountSelector::new("p", config(&["a"]).disabled()).unwrap_err();
        assert!(matches!(
            err,
            SenderError::Configuration(ConfigurationError::ProviderDisabled { .. })
        ));

        let err = AccountSelector::new("p", config(&[])).unwrap_err();
        assert!(matches!(
            err,
            SenderError::Configuration(ConfigurationError::NoItems { .. })
        ));

        let all_disabled = ProviderConfig::new(vec![BaseAccount::new("a").disabled()]);
        let err = AccountSelector::new("p", all_disabled).unwrap_err();
        assert!(matches!(
            err,
            SenderError::Configuration(ConfigurationError::AllItemsDisabled { .. })
        ));

        let err = AccountSelector::new("p", config(&["a", "a"])).unwrap_err();
        assert!(matches!(
            err,
            SenderError::Configuration(ConfigurationError::DuplicateAccount { .. })
        ));
    }

    #[test]
    fn test_disabled_accounts_never_selected() {
        let cfg = ProviderConfig::new(vec![
            BaseAccount::new("on"),
            BaseAccount::new("off").disabled(),
        ]);
        let selector = AccountSelector::new("p", cfg).unwrap();
        let msg = TestMessage::new("p");
        for _ in 0..10 {
            assert_eq!(selector.select(&SendContext::new(), &msg).unwrap().name, "on");
        }

        let pinned = SendContext::new().with_account("off");
        assert!(matches!(
            selector.select(&pinned, &msg),
            Err(SenderError::NoAccount { .. })
        ));
    }

    #[test]
    fn test_enabled_false_from_json_never_selected() {
        let accounts: Vec<BaseAccount> = serde_json::from_str(
            r#"[{"name": "on", "api_key": "k1"}, {"name": "off", "api_key": "k2", "enabled": false}]"#,
        )
        .unwrap();
        let selector = AccountSelector::new("p", ProviderConfig::new(accounts)).unwrap();
        let msg = TestMessage::new("p");
        for _ in 0..10 {
            assert_eq!(selector.select(&SendContext::new(), &msg).unwrap().name, "on");
        }
        assert!(selector
            .select(&SendContext::new().with_account("off"), &msg)
            .is_err());

        let only_off: Vec<BaseAccount> =
            serde_json::from_str(r#"[{"name": "off", "enabled": false}]"#).unwrap();
        assert!(AccountSelector::new("p", ProviderConfig::new(only_off)).is_err());
    }

    #[test]
    fn test_pin_beats_strategy_and_subtype() {
        let cfg = ProviderConfig::new(vec![
            BaseAccount::new("a").with_sub_type("x"),
            BaseAccount::new("b").with_sub_type("y"),
        ]);
        let selector = AccountSelector::new("p", cfg).unwrap();
        let msg = TestMessage::new("p").with_sub_type("x");

        let ctx = SendContext::new().with_account("b");
        for _ in 0..5 {
            assert_eq!(selector.select(&ctx, &msg).unwrap().name, "b");
        }
    }

    #[test]
    fn test_subtype_filter() {
        let cfg = ProviderConfig::new(vec![
            BaseAccount::new("ali").with_sub_type("aliyun"),
            BaseAccount::new("tc").with_sub_type("tencent"),
        ]);
        let selector = AccountSelector::new("sms", cfg).unwrap();

        let msg = TestMessage::new("sms").with_sub_type("tencent");
        for _ in 0..4 {
            assert_eq!(selector.select(&SendContext::new(), &msg).unwrap().name, "tc");
        }

        let none = TestMessage::new("sms").with_sub_type("huawei");
        assert!(matches!(
            selector.select(&SendContext::new(), &none),
            Err(SenderError::NoAccount { .. })
        ));
    }

    #[test]
    fn test_unhealthy_accounts_are_skipped() {
        let selector = AccountSelector::new("p", config(&["a", "b"])).unwrap();
        selector.observe(
            "a",
            &Err(SenderError::Network(crate::errors::NetworkError::Timeout)),
        );
        let msg = TestMessage::new("p");
        for _ in 0..6 {
            assert_eq!(selector.select(&SendContext::new(), &msg).unwrap().name, "b");
        }
        assert_eq!(selector.health_report().status, HealthStatus::Degraded);
    }
}
