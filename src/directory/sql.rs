use super::{
    push_unique, AccountBackend, BackendPool, DirectoryEntry, MismatchModes, SenderRelation,
};
use crate::domain_utils::DomainUtils;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Pool of connections to an iRedMail-style `vmail` database.
pub struct SqlPool {
    pool: SqlitePool,
    timeout: Duration,
}

impl SqlPool {
    pub async fn connect(database_url: &str, max_connections: u32, timeout: Duration) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to connect to database: {database_url}"))?;
        Ok(Self { pool, timeout })
    }

    pub fn from_pool(pool: SqlitePool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl BackendPool for SqlPool {
    async fn acquire(&self) -> Result<Box<dyn AccountBackend>> {
        let conn = tokio::time::timeout(self.timeout, self.pool.acquire())
            .await
            .map_err(|_| anyhow!("timed out acquiring SQL connection"))?
            .context("Failed to acquire SQL connection")?;

        Ok(Box::new(SqlBackend {
            conn: Mutex::new(Some(conn)),
            failed: AtomicBool::new(false),
            timeout: self.timeout,
        }))
    }
}

/// One checked-out connection. A connection that saw a failed query is
/// closed on release instead of going back to the pool.
pub struct SqlBackend {
    conn: Mutex<Option<PoolConnection<Sqlite>>>,
    failed: AtomicBool,
    timeout: Duration,
}

fn account_status(active: i64) -> &'static str {
    if active == 1 {
        "active"
    } else {
        "disabled"
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn like_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl SqlBackend {
    async fn fetch_rows(&self, sql: &str, params: &[&str]) -> Result<Vec<SqliteRow>> {
        log::debug!("[SQL] {sql}");
        log::debug!("[SQL] parameters: {}", params.join(", "));

        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| anyhow!("SQL connection already released"))?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.to_string());
        }

        match tokio::time::timeout(self.timeout, query.fetch_all(&mut **conn)).await {
            Ok(Ok(rows)) => {
                log::debug!("[SQL] {} rows", rows.len());
                Ok(rows)
            }
            Ok(Err(e)) => {
                self.failed.store(true, Ordering::Relaxed);
                Err(e).context("SQL query failed")
            }
            Err(_) => {
                self.failed.store(true, Ordering::Relaxed);
                Err(anyhow!("SQL query timed out after {:?}", self.timeout))
            }
        }
    }

    /// First column of every row, lower-cased.
    async fn fetch_strings(&self, sql: &str, params: &[&str]) -> Result<Vec<String>> {
        let rows = self.fetch_rows(sql, params).await?;
        let mut values = Vec::new();
        for row in rows {
            let value: String = row.try_get(0)?;
            push_unique(&mut values, value.to_lowercase());
        }
        Ok(values)
    }

    async fn exists(&self, sql: &str, params: &[&str]) -> Result<bool> {
        Ok(!self.fetch_rows(sql, params).await?.is_empty())
    }

    async fn maillist_entry(&self, address: &str) -> Result<Option<DirectoryEntry>> {
        let rows = self
            .fetch_rows(
                "SELECT accesspolicy, active FROM maillists WHERE address=? LIMIT 1",
                &[address],
            )
            .await?;
        let row = match rows.first() {
            Some(row) => row,
            None => return Ok(None),
        };

        let policy: Option<String> = row.try_get("accesspolicy")?;
        let active: i64 = row.try_get("active")?;

        let mut entry = DirectoryEntry::new()
            .with("objectClass", ["mailList"])
            .with("enabledService", ["mail", "mlmmj"])
            .with("accountStatus", [account_status(active)]);
        if let Some(policy) = policy.filter(|p| !p.is_empty()) {
            entry.push("accessPolicy", policy);
        }

        let allowed = self
            .fetch_strings("SELECT moderator FROM moderators WHERE address=?", &[address])
            .await?;
        let owners = self
            .fetch_strings("SELECT owner FROM maillist_owners WHERE address=?", &[address])
            .await?;
        Ok(Some(
            entry
                .with("listAllowedUser", allowed)
                .with("listOwner", owners),
        ))
    }

    async fn active_flag(&self, sql: &str, address: &str) -> Result<Option<i64>> {
        let rows = self.fetch_rows(sql, &[address]).await?;
        match rows.first() {
            Some(row) => Ok(Some(row.try_get("active")?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AccountBackend for SqlBackend {
    async fn recipient_entry(&self, address: &str) -> Result<Option<DirectoryEntry>> {
        if let Some(entry) = self.maillist_entry(address).await? {
            return Ok(Some(entry));
        }

        let lookups = [
            ("SELECT active FROM mailbox WHERE username=? LIMIT 1", "mailUser"),
            (
                "SELECT active FROM forwardings WHERE address=? AND is_alias=1 LIMIT 1",
                "mailUser",
            ),
            ("SELECT active FROM alias WHERE address=? LIMIT 1", "mailAlias"),
        ];
        for (sql, object_class) in lookups {
            if let Some(active) = self.active_flag(sql, address).await? {
                return Ok(Some(
                    DirectoryEntry::new()
                        .with("objectClass", [object_class])
                        .with("accountStatus", [account_status(active)]),
                ));
            }
        }

        Ok(None)
    }

    async fn primary_and_alias_domains(&self, domain: &str) -> Result<Vec<String>> {
        let primary = self
            .fetch_strings(
                "SELECT target_domain FROM alias_domain WHERE alias_domain=? LIMIT 1",
                &[domain],
            )
            .await?
            .into_iter()
            .next()
            .unwrap_or_else(|| domain.to_lowercase());

        let mut domains = vec![primary.clone()];
        for alias in self
            .fetch_strings(
                "SELECT alias_domain FROM alias_domain WHERE target_domain=?",
                &[&primary],
            )
            .await?
        {
            push_unique(&mut domains, alias);
        }
        push_unique(&mut domains, domain.to_lowercase());
        Ok(domains)
    }

    async fn is_local_domain(&self, domain: &str, include_backupmx: bool) -> Result<bool> {
        if !DomainUtils::is_domain(domain) {
            return Ok(false);
        }

        let sql = if include_backupmx {
            "SELECT domain FROM domain WHERE domain=? AND active=1 LIMIT 1"
        } else {
            "SELECT domain FROM domain WHERE domain=? AND active=1 AND backupmx=0 LIMIT 1"
        };
        if self.exists(sql, &[domain]).await? {
            return Ok(true);
        }

        self.exists(
            "SELECT alias_domain FROM alias_domain WHERE alias_domain=? AND active=1 LIMIT 1",
            &[domain],
        )
        .await
    }

    async fn list_members(&self, list: &str) -> Result<Vec<String>> {
        let mut members = self
            .fetch_strings(
                "SELECT forwarding FROM forwardings WHERE address=? AND is_list=1 AND active=1",
                &[list],
            )
            .await?;
        for alias in self
            .fetch_strings(
                "SELECT address FROM forwardings
                  WHERE is_alias=1 AND active=1
                    AND forwarding IN (SELECT forwarding FROM forwardings
                                        WHERE address=? AND is_list=1 AND active=1)",
                &[list],
            )
            .await?
        {
            push_unique(&mut members, alias);
        }
        Ok(members)
    }

    async fn list_members_and_moderators(&self, list: &str) -> Result<Vec<String>> {
        let mut allowed = self.list_members(list).await?;
        let extra = [
            "SELECT moderator FROM moderators WHERE address=?",
            "SELECT address FROM maillists WHERE address=?",
        ];
        for sql in extra {
            for value in self.fetch_strings(sql, &[list]).await? {
                push_unique(&mut allowed, value);
            }
        }
        Ok(allowed)
    }

    async fn user_alias_addresses(&self, domain: &str, users: &[String]) -> Result<Vec<String>> {
        let mut addresses = Vec::new();
        for user in users {
            let owners = self
                .fetch_strings(
                    "SELECT username FROM mailbox WHERE username=? AND domain=? AND active=1
                     UNION
                     SELECT forwarding FROM forwardings
                      WHERE address=? AND domain=? AND is_alias=1 AND active=1",
                    &[user, domain, user, domain],
                )
                .await?;

            for owner in owners {
                let aliases = self
                    .fetch_strings(
                        "SELECT address FROM forwardings WHERE forwarding=? AND is_alias=1 AND active=1",
                        &[&owner],
                    )
                    .await?;
                push_unique(&mut addresses, owner);
                for alias in aliases {
                    push_unique(&mut addresses, alias);
                }
            }
        }
        Ok(addresses)
    }

    async fn alias_domain_groups(&self, domains: &[String]) -> Result<Vec<Vec<String>>> {
        let mut groups: Vec<Vec<String>> = Vec::new();
        for domain in domains {
            let target = self
                .fetch_strings(
                    "SELECT target_domain FROM alias_domain WHERE alias_domain=? LIMIT 1",
                    &[domain],
                )
                .await?;
            let primary = match target.into_iter().next() {
                Some(primary) => primary,
                None => {
                    if !self
                        .exists("SELECT domain FROM domain WHERE domain=? LIMIT 1", &[domain])
                        .await?
                    {
                        continue;
                    }
                    domain.to_lowercase()
                }
            };

            let aliases = self
                .fetch_strings(
                    "SELECT alias_domain FROM alias_domain WHERE target_domain=?",
                    &[&primary],
                )
                .await?;
            if aliases.is_empty() {
                continue;
            }

            let mut group = vec![primary];
            for alias in aliases {
                push_unique(&mut group, alias);
            }
            if !groups.contains(&group) {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    async fn sender_relation(
        &self,
        login: &str,
        sender: &str,
        modes: MismatchModes,
    ) -> Result<SenderRelation> {
        if !modes.any() {
            return Ok(SenderRelation::Unrelated);
        }

        let login_user = DomainUtils::local_part(login);
        let login_domain = DomainUtils::extract_domain(login).unwrap_or_default();
        let sender_name = DomainUtils::local_part(sender);
        let sender_domain = DomainUtils::extract_domain(sender).unwrap_or_default();

        let mut real_sender = sender.to_string();

        if modes.strict {
            let extension_pattern = format!(
                "{}+%@{}",
                like_escape(login_user),
                like_escape(&login_domain)
            );
            if self
                .exists(
                    "SELECT address FROM forwardings
                      WHERE address=? AND (forwarding=? OR forwarding LIKE ? ESCAPE '\\') AND is_alias=1
                      LIMIT 1",
                    &[sender, login, &extension_pattern],
                )
                .await?
            {
                log::debug!("Sender {sender} is an alias address of smtp auth username {login}");
                return Ok(SenderRelation::Owned);
            }
            log::debug!("No per-user alias address found.");

            if sender_domain != login_domain
                && self
                    .exists(
                        "SELECT alias_domain FROM alias_domain
                          WHERE alias_domain=? AND target_domain=? LIMIT 1",
                        &[&sender_domain, &login_domain],
                    )
                    .await?
            {
                log::debug!("Sender domain {sender_domain} is an alias domain of {login_domain}");
                if sender_name == login_user {
                    return Ok(SenderRelation::Owned);
                }
                real_sender = format!("{sender_name}@{login_domain}");
            }
        }

        if modes.list_member {
            if self
                .exists(
                    "SELECT forwarding FROM forwardings
                      WHERE address=? AND forwarding=? AND is_list=1 AND active=1 LIMIT 1",
                    &[&real_sender, login],
                )
                .await?
            {
                log::debug!("SASL username ({login}) is a member of mail alias ({sender})");
                return Ok(SenderRelation::Owned);
            }

            if self
                .exists(
                    "SELECT address FROM maillists WHERE address=? AND active=1 LIMIT 1",
                    &[&real_sender],
                )
                .await?
            {
                return Ok(SenderRelation::SubscribableList { list: real_sender });
            }
            log::debug!("No such mailing list account.");
        }

        Ok(SenderRelation::Unrelated)
    }

    async fn release(&self) -> Result<()> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            if self.failed.load(Ordering::Relaxed) {
                log::debug!("Closing SQL connection after failed query");
                conn.close().await.context("Failed to close SQL connection")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const SCHEMA: &str = r"
        CREATE TABLE domain (domain TEXT PRIMARY KEY, backupmx INTEGER NOT NULL DEFAULT 0, active INTEGER NOT NULL DEFAULT 1);
        CREATE TABLE alias_domain (alias_domain TEXT PRIMARY KEY, target_domain TEXT NOT NULL, active INTEGER NOT NULL DEFAULT 1);
        CREATE TABLE mailbox (username TEXT PRIMARY KEY, domain TEXT NOT NULL, active INTEGER NOT NULL DEFAULT 1);
        CREATE TABLE alias (address TEXT PRIMARY KEY, domain TEXT NOT NULL, active INTEGER NOT NULL DEFAULT 1);
        CREATE TABLE forwardings (address TEXT NOT NULL, forwarding TEXT NOT NULL, domain TEXT NOT NULL, is_list INTEGER NOT NULL DEFAULT 0, is_alias INTEGER NOT NULL DEFAULT 0, active INTEGER NOT NULL DEFAULT 1);
        CREATE TABLE maillists (address TEXT PRIMARY KEY, domain TEXT NOT NULL, accesspolicy TEXT, active INTEGER NOT NULL DEFAULT 1);
        CREATE TABLE moderators (address TEXT NOT NULL, moderator TEXT NOT NULL);
        CREATE TABLE maillist_owners (address TEXT NOT NULL, owner TEXT NOT NULL);

        INSERT INTO domain (domain) VALUES ('example.com');
        INSERT INTO domain (domain, backupmx) VALUES ('backup.example', 1);
        INSERT INTO alias_domain (alias_domain, target_domain) VALUES ('example.net', 'example.com');
        INSERT INTO mailbox (username, domain) VALUES ('alice@example.com', 'example.com');
        INSERT INTO mailbox (username, domain) VALUES ('bob@example.com', 'example.com');
        INSERT INTO forwardings (address, forwarding, domain, is_alias) VALUES ('ali@example.com', 'alice@example.com', 'example.com', 1);
        INSERT INTO forwardings (address, forwarding, domain, is_alias) VALUES ('shop@example.com', 'bob+shop@example.com', 'example.com', 1);
        INSERT INTO alias (address, domain) VALUES ('support@example.com', 'example.com');
        INSERT INTO forwardings (address, forwarding, domain, is_list) VALUES ('support@example.com', 'bob@example.com', 'example.com', 1);
        INSERT INTO forwardings (address, forwarding, domain, is_list) VALUES ('support@example.com', 'alice@example.com', 'example.com', 1);
        INSERT INTO maillists (address, domain, accesspolicy) VALUES ('announce@example.com', 'example.com', 'membersandmoderatorsonly');
        INSERT INTO maillists (address, domain, accesspolicy, active) VALUES ('old@example.com', 'example.com', 'public', 0);
        INSERT INTO moderators (address, moderator) VALUES ('announce@example.com', 'boss@elsewhere.test');
        INSERT INTO maillist_owners (address, owner) VALUES ('announce@example.com', 'alice@example.com');
    ";

    /// Single-connection in-memory database with the sample accounts.
    pub async fn sample_pool() -> SqlPool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&pool).await.unwrap();
        }
        SqlPool::from_pool(pool, Duration::from_secs(5))
    }

    #[test]
    fn test_like_escape() {
        assert_eq!(like_escape("a_b%c\\d"), "a\\_b\\%c\\\\d");
        assert_eq!(like_escape("alice"), "alice");
    }

    #[tokio::test]
    async fn test_recipient_entry() {
        let backend = sample_pool().await.acquire().await.unwrap();

        let list = backend
            .recipient_entry("announce@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(list.has_value("objectClass", "mailList"));
        assert!(list.has_value("enabledService", "mlmmj"));
        assert_eq!(list.get("accountStatus").to_vec(), vec!["active"]);
        assert_eq!(list.first("accessPolicy"), Some("membersandmoderatorsonly"));
        assert!(list.has_value("listAllowedUser", "boss@elsewhere.test"));
        assert!(list.has_value("listOwner", "alice@example.com"));

        let disabled = backend
            .recipient_entry("old@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(disabled.first("accountStatus"), Some("disabled"));

        let user = backend
            .recipient_entry("ali@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(user.has_value("objectClass", "mailUser"));

        let alias = backend
            .recipient_entry("support@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(alias.has_value("objectClass", "mailAlias"));

        assert!(backend
            .recipient_entry("nobody@example.com")
            .await
            .unwrap()
            .is_none());
        backend.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_domains() {
        let backend = sample_pool().await.acquire().await.unwrap();
        assert_eq!(
            backend.primary_and_alias_domains("example.net").await.unwrap(),
            vec!["example.com", "example.net"]
        );
        assert!(backend.is_local_domain("example.net", false).await.unwrap());
        assert!(!backend.is_local_domain("backup.example", false).await.unwrap());
        assert!(backend.is_local_domain("backup.example", true).await.unwrap());
        assert!(!backend.is_local_domain("remote.test", true).await.unwrap());

        assert_eq!(
            backend
                .alias_domain_groups(&["example.com".to_string(), "example.net".to_string()])
                .await
                .unwrap(),
            vec![vec!["example.com", "example.net"]]
        );
    }

    #[tokio::test]
    async fn test_members_and_aliases() {
        let backend = sample_pool().await.acquire().await.unwrap();
        let members = backend.list_members("support@example.com").await.unwrap();
        assert!(members.contains(&"bob@example.com".to_string()));
        assert!(members.contains(&"alice@example.com".to_string()));
        assert!(members.contains(&"ali@example.com".to_string()));

        let allowed = backend
            .list_members_and_moderators("announce@example.com")
            .await
            .unwrap();
        assert_eq!(allowed, vec!["boss@elsewhere.test", "announce@example.com"]);

        let users = backend
            .user_alias_addresses("example.com", &["ali@example.com".to_string()])
            .await
            .unwrap();
        assert_eq!(users, vec!["alice@example.com", "ali@example.com"]);
    }

    #[tokio::test]
    async fn test_sender_relation() {
        let backend = sample_pool().await.acquire().await.unwrap();
        let strict = MismatchModes {
            strict: true,
            list_member: false,
        };
        let members = MismatchModes {
            strict: false,
            list_member: true,
        };

        let relation = |login: &'static str, sender: &'static str, modes| {
            let backend = &backend;
            async move { backend.sender_relation(login, sender, modes).await.unwrap() }
        };

        assert_eq!(
            relation("alice@example.com", "ali@example.com", strict).await,
            SenderRelation::Owned
        );
        assert_eq!(
            relation("bob@example.com", "shop@example.com", strict).await,
            SenderRelation::Owned
        );
        assert_eq!(
            relation("alice@example.com", "alice@example.net", strict).await,
            SenderRelation::Owned
        );
        assert_eq!(
            relation("alice@example.com", "bob@example.com", strict).await,
            SenderRelation::Unrelated
        );
        assert_eq!(
            relation("bob@example.com", "support@example.com", members).await,
            SenderRelation::Owned
        );
        assert_eq!(
            relation("bob@example.com", "announce@example.com", members).await,
            SenderRelation::SubscribableList {
                list: "announce@example.com".to_string()
            }
        );
        assert_eq!(
            relation("bob@example.com", "support@example.com", strict).await,
            SenderRelation::Unrelated
        );
    }

    #[tokio::test]
    async fn test_login_domain_is_not_a_like_pattern() {
        let pool = sample_pool().await;
        sqlx::query(
            "INSERT INTO forwardings (address, forwarding, domain, is_alias)
             VALUES ('deals@shopxa.test', 'carol+deals@shopxa.test', 'shopxa.test', 1)",
        )
        .execute(&pool.pool)
        .await
        .unwrap();

        let backend = pool.acquire().await.unwrap();
        let strict = MismatchModes {
            strict: true,
            list_member: false,
        };
        assert_eq!(
            backend
                .sender_relation("carol@shop_a.test", "deals@shopxa.test", strict)
                .await
                .unwrap(),
            SenderRelation::Unrelated
        );
        assert_eq!(
            backend
                .sender_relation("carol@shopxa.test", "deals@shopxa.test", strict)
                .await
                .unwrap(),
            SenderRelation::Owned
        );
    }

    #[tokio::test]
    async fn test_release_returns_connection() {
        let pool = sample_pool().await;
        let first = pool.acquire().await.unwrap();
        first.release().await.unwrap();
        assert!(first.recipient_entry("alice@example.com").await.is_err());

        let second = pool.acquire().await.unwrap();
        assert!(second
            .recipient_entry("alice@example.com")
            .await
            .unwrap()
            .is_some());
    }
}
