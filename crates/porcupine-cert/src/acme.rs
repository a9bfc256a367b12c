//! ACME client for automatic certificate provisioning via Let's Encrypt
//!
//! Uses the HTTP-01 challenge: the key authorization is published into a
//! shared [`Http01ChallengeStore`] which the plain HTTP listener serves under
//! `/.well-known/acme-challenge/<token>`.

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::authority::{parse_expiry, CertificateAuthority, IssuedCertificate};
use crate::challenge::Http01ChallengeStore;
use crate::CertError;

/// ACME configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Contact email registered with the account
    pub contact_email: Option<String>,
    /// Use Let's Encrypt staging environment (for testing)
    pub use_staging: bool,
    /// Where the account credentials JSON is kept
    pub account_path: PathBuf,
    /// Order polling attempts before giving up
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

impl AcmeConfig {
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            account_path: cert_dir.into().join("acme").join("account.json"),
            ..Default::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.contact_email = Some(email.into());
        self
    }

    pub fn with_staging(mut self, staging: bool) -> Self {
        self.use_staging = staging;
        self
    }

    pub fn directory_url(&self) -> &'static str {
        if self.use_staging {
            LetsEncrypt::Staging.url()
        } else {
            LetsEncrypt::Production.url()
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            contact_email: None,
            use_staging: false,
            account_path: PathBuf::from("./certs/acme/account.json"),
            poll_attempts: 30,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Certificate authority backed by an ACME server
pub struct AcmeAuthority {
    config: AcmeConfig,
    challenges: Http01ChallengeStore,
    account: RwLock<Option<Arc<Account>>>,
}

impl AcmeAuthority {
    pub fn new(config: AcmeConfig, challenges: Http01ChallengeStore) -> Self {
        Self {
            config,
            challenges,
            account: RwLock::new(None),
        }
    }

    /// Get or create the ACME account, caching it for later orders
    async fn account(&self) -> Result<Arc<Account>, CertError> {
        if let Some(account) = self.account.read().await.as_ref() {
            return Ok(account.clone());
        }

        let mut slot = self.account.write().await;
        if let Some(account) = slot.as_ref() {
            return Ok(account.clone());
        }

        let acme_err = |e: instant_acme::Error| CertError::Acme(e.to_string());
        let creds_path = &self.config.account_path;

        let account = if creds_path.exists() {
            debug!(path = %creds_path.display(), "Loading ACME account from disk");
            let creds_json = tokio::fs::read_to_string(creds_path)
                .await
                .map_err(|e| CertError::Storage(e.to_string()))?;
            let creds: AccountCredentials = serde_json::from_str(&creds_json)
                .map_err(|e| CertError::Storage(format!("Invalid account credentials: {}", e)))?;
            Account::builder()
                .map_err(acme_err)?
                .from_credentials(creds)
                .await
                .map_err(acme_err)?
        } else {
            info!(
                email = self.config.contact_email.as_deref().unwrap_or("<none>"),
                staging = self.config.use_staging,
                "Creating new ACME account"
            );
            let contacts: Vec<String> = self
                .config
                .contact_email
                .iter()
                .map(|email| format!("mailto:{email}"))
                .collect();
            let contact_refs: Vec<&str> = contacts.iter().map(String::as_str).collect();

            let (account, creds) = Account::builder()
                .map_err(acme_err)?
                .create(
                    &NewAccount {
                        contact: &contact_refs,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    self.config.directory_url().to_string(),
                    None,
                )
                .await
                .map_err(acme_err)?;

            if let Some(parent) = creds_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CertError::Storage(e.to_string()))?;
            }
            let creds_json = serde_json::to_string_pretty(&creds)
                .map_err(|e| CertError::Storage(e.to_string()))?;
            tokio::fs::write(creds_path, creds_json)
                .await
                .map_err(|e| CertError::Storage(e.to_string()))?;

            account
        };

        let account = Arc::new(account);
        *slot = Some(account.clone());
        Ok(account)
    }

    async fn order_certificate(
        &self,
        domain: &str,
        published: &mut Vec<String>,
    ) -> Result<IssuedCertificate, CertError> {
        let acme_err = |e: instant_acme::Error| CertError::Acme(e.to_string());
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(acme_err)?;
        debug!(domain, status = ?order.state().status, "ACME order created");

        {
            let mut authorizations = order.authorizations();
            while let Some(authz) = authorizations.next().await {
                let mut authz = authz.map_err(acme_err)?;
                if matches!(authz.status, AuthorizationStatus::Valid) {
                    continue;
                }

                let mut challenge = authz.challenge(ChallengeType::Http01).ok_or_else(|| {
                    CertError::Acme(format!("No HTTP-01 challenge offered for {}", domain))
                })?;

                let token = challenge.token.clone();
                let key_authorization = challenge.key_authorization();
                self.challenges.publish(&token, key_authorization.as_str());
                published.push(token);

                challenge.set_ready().await.map_err(acme_err)?;
            }
        }

        let mut attempts = 0;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            let state = order.refresh().await.map_err(acme_err)?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    error!(domain, state = ?state, "ACME order validation failed");
                    return Err(CertError::Acme(format!(
                        "Order validation failed for {}",
                        domain
                    )));
                }
                status => debug!(domain, ?status, "Waiting for ACME order"),
            }

            attempts += 1;
            if attempts >= self.config.poll_attempts {
                return Err(CertError::Acme(format!(
                    "Challenge validation timeout for {}",
                    domain
                )));
            }
        }

        // instant-acme generates the key pair and CSR
        let private_key_pem = order.finalize().await.map_err(acme_err)?;

        let certificate_chain_pem = loop {
            match order.certificate().await.map_err(acme_err)? {
                Some(chain) => break chain,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };

        let expires_at = parse_expiry(&certificate_chain_pem)?;

        Ok(IssuedCertificate {
            private_key_pem,
            certificate_chain_pem,
            expires_at,
        })
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn obtain(&self, domain: &str) -> Result<IssuedCertificate, CertError> {
        info!(domain, staging = self.config.use_staging, "Requesting ACME certificate");

        let mut published = Vec::new();
        let result = self.order_certificate(domain, &mut published).await;

        for token in &published {
            self.challenges.withdraw(token);
        }

        match result {
            Ok(cert) => {
                info!(domain, expires_at = %cert.expires_at, "ACME certificate issued");
                Ok(cert)
            }
            Err(e) => Err(CertError::IssuanceFailed {
                domain: domain.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "acme"
    }
}
