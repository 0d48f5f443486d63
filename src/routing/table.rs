//! One database's view of the cluster: who routes, who reads, who writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::address::Address;
use crate::config::AccessMode;
use crate::error::DriverError;
use crate::types::{BoltDict, BoltValue};

/// A routing table snapshot. Tables are shared behind `Arc` and never
/// mutated in place; removing a server produces a new table.
#[derive(Debug)]
pub struct RoutingTable {
    /// Database the table was requested for; empty for the home database.
    pub database: String,
    pub routers: Vec<Address>,
    pub readers: Vec<Address>,
    pub writers: Vec<Address>,
    pub ttl: Duration,
    pub updated_at: Instant,
    /// `None` never expires (direct connections).
    expires_at: Option<Instant>,
    /// The last answer had no writers, so the seed router is tried first next
    /// time in case the cluster has since elected a leader elsewhere.
    pub(crate) initialized_without_writers: bool,
    next_reader: AtomicUsize,
}

impl RoutingTable {
    /// A table that only knows the seed router and is due for refresh.
    pub fn initial(database: impl Into<String>, router: Address) -> Self {
        let now = Instant::now();
        Self::build(
            database.into(),
            vec![router],
            Vec::new(),
            Vec::new(),
            Duration::ZERO,
            now,
            Some(now),
            true,
        )
    }

    /// A fixed table for a single server that serves every role.
    pub fn direct(address: Address) -> Self {
        Self::build(
            String::new(),
            vec![address.clone()],
            vec![address.clone()],
            vec![address],
            Duration::ZERO,
            Instant::now(),
            None,
            false,
        )
    }

    /// Builds a table from the `rt` dictionary of a ROUTE summary.
    pub fn parse(database: impl Into<String>, rt: &BoltDict) -> Result<Self, DriverError> {
        let ttl = rt
            .get("ttl")
            .and_then(BoltValue::as_int)
            .ok_or_else(|| DriverError::protocol("routing table has no ttl"))?;
        if ttl < 0 {
            return Err(DriverError::protocol(format!("negative routing table ttl: {ttl}")));
        }
        let ttl = Duration::from_secs(ttl as u64);

        let servers = rt
            .get("servers")
            .and_then(BoltValue::as_list)
            .ok_or_else(|| DriverError::protocol("routing table has no server list"))?;

        let (mut routers, mut readers, mut writers) = (Vec::new(), Vec::new(), Vec::new());
        for entry in servers {
            let entry = entry
                .as_dict()
                .ok_or_else(|| DriverError::protocol("routing table entry is not a map"))?;
            let role = entry.get("role").and_then(BoltValue::as_str).unwrap_or("");
            let addresses = entry
                .get("addresses")
                .and_then(BoltValue::as_list)
                .ok_or_else(|| DriverError::protocol("routing table entry has no addresses"))?;
            let target = match role {
                "ROUTE" => &mut routers,
                "READ" => &mut readers,
                "WRITE" => &mut writers,
                other => {
                    tracing::debug!(role = other, "ignoring unknown routing role");
                    continue;
                }
            };
            for address in addresses {
                let address = address
                    .as_str()
                    .ok_or_else(|| DriverError::protocol("routing address is not a string"))?;
                let address = Address::parse(address)
                    .map_err(|e| DriverError::protocol(format!("bad routing address: {e}")))?;
                if !target.contains(&address) {
                    target.push(address);
                }
            }
        }

        let now = Instant::now();
        let no_writers = writers.is_empty();
        Ok(Self::build(
            database.into(),
            routers,
            readers,
            writers,
            ttl,
            now,
            now.checked_add(ttl),
            no_writers,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        database: String,
        routers: Vec<Address>,
        readers: Vec<Address>,
        writers: Vec<Address>,
        ttl: Duration,
        updated_at: Instant,
        expires_at: Option<Instant>,
        initialized_without_writers: bool,
    ) -> Self {
        Self {
            database,
            routers,
            readers,
            writers,
            ttl,
            updated_at,
            expires_at,
            initialized_without_writers,
            next_reader: AtomicUsize::new(0),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }

    /// Usable without a refresh for `mode`.
    pub fn is_fresh(&self, mode: AccessMode) -> bool {
        !self.is_expired()
            && !self.routers.is_empty()
            && !self.readers.is_empty()
            && (mode == AccessMode::Read || !self.writers.is_empty())
    }

    /// An answer worth keeping: someone to ask next time and someone to read
    /// from.
    pub fn is_usable(&self) -> bool {
        !self.routers.is_empty() && !self.readers.is_empty()
    }

    /// Whether the table can still serve `mode`, expired or not.
    pub fn can_serve(&self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => !self.readers.is_empty(),
            AccessMode::Write => !self.writers.is_empty(),
        }
    }

    /// Unused for long enough past its expiry to be forgotten.
    pub fn is_purgeable(&self, delay: Duration) -> bool {
        self.expires_at
            .and_then(|t| t.checked_add(delay))
            .is_some_and(|t| Instant::now() >= t)
    }

    /// Picks a server: the first writer, or the next reader in rotation.
    pub fn select(&self, mode: AccessMode) -> Result<Address, DriverError> {
        let pool = match mode {
            AccessMode::Read => &self.readers,
            AccessMode::Write => &self.writers,
        };
        if pool.is_empty() {
            let role = match mode {
                AccessMode::Read => "readers",
                AccessMode::Write => "writers",
            };
            return Err(DriverError::SessionExpired(format!(
                "no {role} available for database '{}'",
                self.display_name()
            )));
        }
        let index = match mode {
            AccessMode::Read => self.next_reader.fetch_add(1, Ordering::Relaxed) % pool.len(),
            AccessMode::Write => 0,
        };
        Ok(pool[index].clone())
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.routers.contains(address)
            || self.readers.contains(address)
            || self.writers.contains(address)
    }

    /// A copy without `address` in any role.
    pub fn without(&self, address: &Address) -> Self {
        let keep = |list: &[Address]| list.iter().filter(|a| *a != address).cloned().collect();
        Self::build(
            self.database.clone(),
            keep(&self.routers),
            keep(&self.readers),
            keep(&self.writers),
            self.ttl,
            self.updated_at,
            self.expires_at,
            self.initialized_without_writers,
        )
    }

    /// A copy that no longer considers `address` a writer.
    pub fn without_writer(&self, address: &Address) -> Self {
        Self::build(
            self.database.clone(),
            self.routers.clone(),
            self.readers.clone(),
            self.writers.iter().filter(|a| *a != address).cloned().collect(),
            self.ttl,
            self.updated_at,
            self.expires_at,
            self.initialized_without_writers,
        )
    }

    fn display_name(&self) -> &str {
        if self.database.is_empty() {
            "<default>"
        } else {
            &self.database
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::routing_table;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn parses_roles() {
        let rt = routing_table(300, &["r1:7687"], &["s1:7687", "s2:7687"], &["w1:7687"]);
        let table = RoutingTable::parse("movies", &rt).unwrap();
        assert_eq!(table.routers, vec![addr("r1:7687")]);
        assert_eq!(table.readers, vec![addr("s1:7687"), addr("s2:7687")]);
        assert_eq!(table.writers, vec![addr("w1:7687")]);
        assert_eq!(table.ttl, Duration::from_secs(300));
        assert!(table.is_fresh(AccessMode::Write));
        assert!(!table.initialized_without_writers);
    }

    #[test]
    fn rejects_garbage() {
        let mut rt = routing_table(300, &["r1:7687"], &["s1:7687"], &[]);
        rt.insert("ttl".into(), BoltValue::Integer(-1));
        assert!(matches!(
            RoutingTable::parse("", &rt),
            Err(DriverError::Protocol(_))
        ));
        assert!(RoutingTable::parse("", &BoltDict::new()).is_err());
    }

    #[test]
    fn readers_rotate_and_never_include_writer_only_servers() {
        let rt = routing_table(300, &["r1:7687"], &["s1:7687", "s2:7687"], &["w1:7687"]);
        let table = RoutingTable::parse("", &rt).unwrap();
        let picks: Vec<Address> = (0..4)
            .map(|_| table.select(AccessMode::Read).unwrap())
            .collect();
        assert_eq!(
            picks,
            vec![addr("s1:7687"), addr("s2:7687"), addr("s1:7687"), addr("s2:7687")]
        );
        assert_eq!(table.select(AccessMode::Write).unwrap(), addr("w1:7687"));
    }

    #[test]
    fn no_writers_is_session_expired() {
        let rt = routing_table(300, &["r1:7687"], &["s1:7687"], &[]);
        let table = RoutingTable::parse("", &rt).unwrap();
        assert!(table.initialized_without_writers);
        assert!(table.is_fresh(AccessMode::Read));
        assert!(!table.is_fresh(AccessMode::Write));
        assert!(matches!(
            table.select(AccessMode::Write),
            Err(DriverError::SessionExpired(_))
        ));
    }

    #[test]
    fn removing_servers() {
        let rt = routing_table(300, &["a:1", "b:1"], &["a:1", "c:1"], &["a:1"]);
        let table = RoutingTable::parse("", &rt).unwrap();

        let without_a = table.without(&addr("a:1"));
        assert!(!without_a.contains(&addr("a:1")));
        assert_eq!(without_a.routers, vec![addr("b:1")]);

        let demoted = table.without_writer(&addr("a:1"));
        assert!(demoted.writers.is_empty());
        assert_eq!(demoted.readers, table.readers);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_follows_ttl() {
        let rt = routing_table(10, &["r1:7687"], &["s1:7687"], &["w1:7687"]);
        let table = RoutingTable::parse("", &rt).unwrap();
        assert!(!table.is_expired());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(table.is_expired());
        assert!(!table.is_fresh(AccessMode::Read));
        assert!(!table.is_purgeable(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(table.is_purgeable(Duration::from_secs(30)));
    }

    #[test]
    fn direct_table_never_expires() {
        let table = RoutingTable::direct(addr("db:7687"));
        assert!(table.is_fresh(AccessMode::Write));
        assert!(!table.is_purgeable(Duration::ZERO));
        assert_eq!(table.select(AccessMode::Read).unwrap(), addr("db:7687"));
    }
}
