//! Database credentials
//!
//! Bootstrap passwords live in a well-known secret in the operator namespace.
//! Every instance copies them into its own `db-creds` secret through the
//! config batch, which is also where a clone reads the source password from.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use stratum_common::retry::{poll_until, PollPolicy};
use stratum_common::Error;

use crate::client::ClusterClient;

/// Key of the admin password in the operator credentials secret
pub const ADMIN_PASSWORD_KEY: &str = "ADMIN_PASSWORD";
/// Key of the application user password in the operator credentials secret
pub const USER_PASSWORD_KEY: &str = "USER_PASSWORD";
/// Key of the postgres superuser password in the operator credentials secret
pub const POSTGRES_PASSWORD_KEY: &str = "POSTGRES_PASSWORD";

/// Per-instance secret holding database passwords
pub const DB_CREDS_SECRET: &str = "db-creds";
/// Admin password key inside [`DB_CREDS_SECRET`]
pub const DB_CREDS_ADMIN_KEY: &str = "HUB_POSTGRES_ADMIN_PASSWORD_FILE";
/// User password key inside [`DB_CREDS_SECRET`]
pub const DB_CREDS_USER_KEY: &str = "HUB_POSTGRES_USER_PASSWORD_FILE";
/// Superuser password key inside [`DB_CREDS_SECRET`]
pub const DB_CREDS_POSTGRES_KEY: &str = "HUB_POSTGRES_POSTGRES_PASSWORD_FILE";

/// Bootstrap database passwords
#[derive(Clone, PartialEq, Eq)]
pub struct DbPasswords {
    /// Owner of the application schemas
    pub admin: String,
    /// Unprivileged application user
    pub user: String,
    /// postgres superuser
    pub postgres: String,
}

impl fmt::Debug for DbPasswords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbPasswords")
            .field("admin", &"<redacted>")
            .field("user", &"<redacted>")
            .field("postgres", &"<redacted>")
            .finish()
    }
}

impl DbPasswords {
    /// Extract the three passwords from secret data
    pub fn from_secret_data(data: &BTreeMap<String, String>) -> Result<Self, Error> {
        let get = |key: &str| {
            data.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| Error::platform("read_credentials", format!("missing key {key}")))
        };
        Ok(Self {
            admin: get(ADMIN_PASSWORD_KEY)?,
            user: get(USER_PASSWORD_KEY)?,
            postgres: get(POSTGRES_PASSWORD_KEY)?,
        })
    }
}

/// Fetch the bootstrap passwords, retrying until the secret is readable.
///
/// Lookup failures (missing secret, missing keys, API errors) are tolerated
/// and retried; exhausting `policy` yields a timeout.
pub async fn fetch_bootstrap_passwords(
    client: &dyn ClusterClient,
    operator_namespace: &str,
    secret: &str,
    policy: &PollPolicy,
) -> Result<DbPasswords, Error> {
    let operation = format!("credentials secret {operator_namespace}/{secret}");
    poll_until(policy, &operation, || async move {
        match client.get_secret_data(operator_namespace, secret).await {
            Ok(Some(data)) => match DbPasswords::from_secret_data(&data) {
                Ok(passwords) => Ok(Some(passwords)),
                Err(e) => {
                    warn!(error = %e, secret, "credentials secret incomplete, retrying");
                    Ok(None)
                }
            },
            Ok(None) => {
                debug!(secret, namespace = operator_namespace, "credentials secret not found yet");
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, secret, "failed to read credentials secret, retrying");
                Ok(None)
            }
        }
    })
    .await
}

/// Read the database admin password of an existing instance (clone source)
pub async fn source_db_password(
    client: &dyn ClusterClient,
    source_namespace: &str,
) -> Result<String, Error> {
    let data = client
        .get_secret_data(source_namespace, DB_CREDS_SECRET)
        .await?
        .ok_or_else(|| {
            Error::platform(
                "source_db_password",
                format!("secret {source_namespace}/{DB_CREDS_SECRET} not found"),
            )
        })?;

    data.get(DB_CREDS_ADMIN_KEY)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| {
            Error::platform(
                "source_db_password",
                format!("secret {source_namespace}/{DB_CREDS_SECRET} missing {DB_CREDS_ADMIN_KEY}"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::testing::password_data;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn debug_output_hides_passwords() {
        let passwords = DbPasswords::from_secret_data(&password_data()).unwrap();
        let rendered = format!("{passwords:?}");
        assert!(!rendered.contains("admin-pw"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn missing_key_is_reported() {
        let mut data = password_data();
        data.remove(USER_PASSWORD_KEY);
        let err = DbPasswords::from_secret_data(&data).unwrap_err();
        assert!(err.to_string().contains(USER_PASSWORD_KEY));
    }

    #[tokio::test]
    async fn fetch_tolerates_errors_until_secret_appears() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut client = MockClusterClient::new();
        client.expect_get_secret_data().returning(move |_, _| {
            match c.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::platform("get_secret", "connection reset")),
                1 => Ok(None),
                _ => Ok(Some(password_data())),
            }
        });

        let passwords = fetch_bootstrap_passwords(
            &client,
            "stratum-system",
            "stratum-db-passwords",
            &PollPolicy::immediate(5),
        )
        .await
        .unwrap();

        assert_eq!(passwords.admin, "admin-pw");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetch_is_bounded() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_secret_data()
            .times(4)
            .returning(|_, _| Ok(None));

        let err = fetch_bootstrap_passwords(
            &client,
            "stratum-system",
            "stratum-db-passwords",
            &PollPolicy::immediate(4),
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn source_password_comes_from_db_creds() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_secret_data()
            .withf(|ns, name| ns == "bd-source" && name == DB_CREDS_SECRET)
            .returning(|_, _| {
                Ok(Some(BTreeMap::from([(
                    DB_CREDS_ADMIN_KEY.to_string(),
                    "source-pw".to_string(),
                )])))
            });

        let pw = source_db_password(&client, "bd-source").await.unwrap();
        assert_eq!(pw, "source-pw");
    }

    #[tokio::test]
    async fn missing_source_secret_is_a_platform_error() {
        let mut client = MockClusterClient::new();
        client.expect_get_secret_data().returning(|_, _| Ok(None));

        let err = source_db_password(&client, "bd-source").await.unwrap_err();
        assert!(err.is_platform());
    }
}
