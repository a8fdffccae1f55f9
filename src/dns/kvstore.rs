//! Client for the replicated key/value store and the backend built on it
//!
//! The store is an opaque peer reached over a persistent stream connection
//! speaking a line-oriented protocol: `GET <key>` answered with
//! `VALUE <len>` + bytes or `NOT_FOUND`, and `SET <key> <len>` + bytes
//! answered with `STORED`. Values are per-key atomic, so the only
//! coordination this side needs is the per-account lock arena around
//! bind/unbind.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::dns::attrs::RecordAttribute;
use crate::dns::store::{
    fqdn_for, synthesize_soa, validated_contact, AccountInfo, AnswerRecord, Backend, BoundAccount,
    StoreError, SubdomainInfo,
};

type Result<T> = std::result::Result<T, StoreError>;

/// All backend reads are bounded by this, so a dead peer turns into an error
/// instead of a stuck handler.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a bind waits on another packet holding the same account.
const BIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Line-protocol client over one persistent connection. The connection is
/// behind a mutex: requests and responses are strictly paired, so callers
/// serialize per exchange.
pub struct KvClient {
    conn: Mutex<BufReader<TcpStream>>,
}

impl KvClient {
    pub fn connect(host: &str, port: u16) -> Result<KvClient> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(KvClient {
            conn: Mutex::new(BufReader::new(stream)),
        })
    }

    fn read_line(conn: &mut BufReader<TcpStream>) -> Result<String> {
        let mut line = Vec::new();
        conn.read_until(b'\n', &mut line)?;
        if line.is_empty() {
            return Err(StoreError::StorePeer("connection closed".to_string()));
        }
        Ok(String::from_utf8_lossy(&line).trim_end().to_string())
    }

    /// Fetch a value. `Ok(None)` means the key does not exist; an empty
    /// stored value is treated the same way.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.lock();
        conn.get_mut().write_all(format!("GET {}\r\n", key).as_bytes())?;
        conn.get_mut().flush()?;

        let reply = Self::read_line(&mut conn)?;
        let mut tokens = reply.split_whitespace();
        match tokens.next() {
            Some("NOT_FOUND") => Ok(None),
            Some("VALUE") => {
                let len: usize = tokens
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| StoreError::StorePeer(reply.clone()))?;
                if len == 0 {
                    Self::read_line(&mut conn)?;
                    return Ok(None);
                }
                let mut value = vec![0u8; len];
                conn.read_exact(&mut value)?;
                // Consume the terminating \r\n after the payload
                Self::read_line(&mut conn)?;
                Ok(Some(value))
            }
            _ => Err(StoreError::StorePeer(reply)),
        }
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.get_mut()
            .write_all(format!("SET {} {}\r\n", key, value.len()).as_bytes())?;
        conn.get_mut().write_all(value)?;
        conn.get_mut().write_all(b"\r\n")?;
        conn.get_mut().flush()?;

        let reply = Self::read_line(&mut conn)?;
        if reply.starts_with("STORED") {
            Ok(())
        } else {
            Err(StoreError::StorePeer(reply))
        }
    }
}

/// Backend adapter over the replicated store.
///
/// The lock arena maps account hashes to mutexes created on demand and never
/// reclaimed; its size is bounded by the number of accounts that ever
/// register. Holding an account's mutex for the bind/unbind bracket is the
/// system's sole protection against interleaved updates to one account.
pub struct KvBackend {
    client: KvClient,
    suffix_base: String,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KvBackend {
    pub fn connect(host: &str, port: u16, suffix_base: &str) -> Result<KvBackend> {
        let client = KvClient::connect(host, port)?;
        log::info!("connected to store at {}:{}", host, port);
        Ok(KvBackend {
            client,
            suffix_base: suffix_base.to_string(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, key_hash: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(key_hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn get_account(&self, key_hash: &str) -> Result<Option<AccountInfo>> {
        match self.client.get(key_hash)? {
            Some(bytes) => Ok(Some(AccountInfo::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_account(&self, account: &AccountInfo) -> Result<()> {
        self.client.set(account.key_hash(), &account.to_bytes()?)
    }

    fn get_subdomain(&self, fqdn: &str) -> Result<Option<SubdomainInfo>> {
        match self.client.get(fqdn)? {
            Some(bytes) => Ok(Some(SubdomainInfo::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_subdomain(&self, info: &SubdomainInfo) -> Result<()> {
        self.client.set(info.fqdn(), &info.to_bytes()?)
    }
}

impl Backend for KvBackend {
    fn assure_account(&self, key_hash: &str) -> Result<()> {
        let lock = self.lock_for(key_hash);
        let _guard = lock
            .try_lock_arc_for(BIND_TIMEOUT)
            .ok_or(StoreError::BindTimeout)?;
        if self.get_account(key_hash)?.is_none() {
            let account = AccountInfo::new(key_hash, &self.suffix_base);
            self.save_account(&account)?;
            log::info!("created account {}", key_hash);
        }
        Ok(())
    }

    fn sequence_number(&self, key_hash: &str) -> Result<i64> {
        self.get_account(key_hash)?
            .map(|a| a.sequence_number())
            .ok_or(StoreError::AccountMissing)
    }

    fn bind(&self, key_hash: &str) -> Result<BoundAccount> {
        let lock = self.lock_for(key_hash);
        let guard = lock
            .try_lock_arc_for(BIND_TIMEOUT)
            .ok_or(StoreError::BindTimeout)?;
        let account = self
            .get_account(key_hash)?
            .ok_or(StoreError::AccountMissing)?;
        log::debug!("bound account {}", key_hash);
        Ok(BoundAccount::new(account, Some(guard)))
    }

    fn unbind(&self, bound: BoundAccount) -> Result<()> {
        if bound.is_dirty() {
            self.save_account(&bound.account)?;
            log::debug!("saved account {}", bound.account.key_hash());
        }
        // Dropping the bound copy releases the account's lock slot
        Ok(())
    }

    fn add_record(
        &self,
        bound: &mut BoundAccount,
        subdomain: &str,
        rtype: &str,
        content: &str,
        ttl: i32,
        attrs: &[RecordAttribute],
    ) -> Result<()> {
        let fqdn = fqdn_for(subdomain, bound.account.domain_suffix());
        let mut info = match self.get_subdomain(&fqdn)? {
            Some(info) => info,
            None => {
                log::debug!("creating subdomain record set for {}", fqdn);
                bound.account.add_subdomain(subdomain);
                bound.mark_dirty();
                SubdomainInfo::new(&fqdn, bound.account.key_hash())
            }
        };
        info.add_record(rtype, content, ttl, attrs);
        self.save_subdomain(&info)
    }

    fn delete_records(
        &self,
        bound: &mut BoundAccount,
        subdomain: &str,
        rtype: &str,
        content: &str,
    ) -> Result<()> {
        let fqdn = fqdn_for(subdomain, bound.account.domain_suffix());
        let mut info = match self.get_subdomain(&fqdn)? {
            Some(info) => info,
            None => return Ok(()),
        };
        info.delete_records(rtype, content);
        self.save_subdomain(&info)
    }

    fn update_suffix(&self, bound: &mut BoundAccount, new_suffix: &str) -> Result<()> {
        let auto_suffix = format!("{}.{}", bound.account.key_hash(), self.suffix_base);
        let subdomains = bound.account.subdomains().to_vec();
        log::debug!("moving {} subdomains under {}", subdomains.len(), new_suffix);
        for subdomain in subdomains {
            let fqdn = fqdn_for(&subdomain, bound.account.domain_suffix());
            let mut info = self
                .get_subdomain(&fqdn)?
                .ok_or_else(|| StoreError::StorePeer(format!("missing subdomain {}", fqdn)))?;
            info.replace_suffix(&auto_suffix, new_suffix)?;
            self.save_subdomain(&info)?;
        }
        let (soa_ttl, contact) = validated_contact(&self.suffix_base);
        bound.account.set_domain_suffix(new_suffix, soa_ttl, &contact);
        bound.mark_dirty();
        Ok(())
    }

    fn answer_query(&self, qname: &str, qclass: &str, qtype: &str) -> Result<Vec<AnswerRecord>> {
        if qclass != "IN" {
            return Ok(Vec::new());
        }
        let info = match self.get_subdomain(qname)? {
            Some(info) => info,
            None => return Ok(Vec::new()),
        };

        let mut answers = Vec::new();
        if qtype == "SOA" {
            let account = self
                .get_account(info.account_hash())?
                .ok_or(StoreError::AccountMissing)?;
            answers.push(synthesize_soa(qname, &account, &self.suffix_base));
        }
        for record in info.records() {
            if qtype == "ANY" || record.rtype == qtype {
                answers.push(AnswerRecord {
                    name: qname.to_string(),
                    rtype: record.rtype.clone(),
                    content: record.content.clone(),
                    ttl: record.ttl,
                });
            }
        }
        log::debug!("answering {} {} with {} records", qname, qtype, answers.len());
        Ok(answers)
    }
}
