//! Account and subdomain state, and the backend contract over it
//!
//! An account is keyed by the hash of its public key and owns a domain
//! suffix plus the subdomains published under it. Each subdomain holds the
//! record set for one fully-qualified name. Both are persisted through a
//! simple length-prefixed encoding (4-byte lengths, fixed-width integers)
//! that is deliberately separate from the wire codec: it only ever travels
//! between this process and the storage tier.

use chrono::TimeZone;
use derive_more::{Display, Error, From};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;

use crate::dns::attrs::RecordAttribute;

#[derive(Debug, Display, From, Error)]
pub enum StoreError {
    Io(std::io::Error),
    Hex(hex::FromHexError),
    /// Persisted data ended before the structure did.
    #[display(fmt = "truncated persisted data")]
    Truncated,
    #[display(fmt = "account not found")]
    AccountMissing,
    #[display(fmt = "timed out binding account")]
    BindTimeout,
    /// A subdomain's name does not sit under the expected auto-assigned
    /// suffix; usually a sign of a repeated VALIDATE.
    #[display(fmt = "name does not end with the expected suffix")]
    SuffixMismatch,
    #[display(fmt = "domain ownership could not be validated")]
    DomainNotValidated,
    /// The storage peer replied with something other than the protocol.
    StorePeer(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, StoreError>;

pub const DEFAULT_SUFFIX_BASE: &str = "donardns.net";
const DEFAULT_SOA_TTL: i32 = 86400;
/// SOA metadata applied when an account validates a vanity suffix.
const VALIDATED_SOA_TTL: i32 = 1000;

/// Compose the fully-qualified name for a subdomain of an account. An empty
/// subdomain addresses the suffix itself.
pub fn fqdn_for(subdomain: &str, suffix: &str) -> String {
    if subdomain.is_empty() {
        suffix.to_string()
    } else {
        format!("{}.{}", subdomain, suffix)
    }
}

// ---- persisted encoding helpers ----

fn put_u32(out: &mut Vec<u8>, val: u32) {
    out.extend_from_slice(&val.to_be_bytes());
}

fn put_i32(out: &mut Vec<u8>, val: i32) {
    out.extend_from_slice(&val.to_be_bytes());
}

fn put_i64(out: &mut Vec<u8>, val: i64) {
    out.extend_from_slice(&val.to_be_bytes());
}

fn put_string(out: &mut Vec<u8>, val: &str) {
    put_u32(out, val.len() as u32);
    out.extend_from_slice(val.as_bytes());
}

struct PersistedReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PersistedReader<'a> {
    fn new(data: &'a [u8]) -> PersistedReader<'a> {
        PersistedReader { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(StoreError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(raw))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }
}

/// One DNS record held by a subdomain.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub rtype: String,
    pub content: String,
    pub ttl: i32,
    pub attributes: Vec<RecordAttribute>,
}

/// A record as returned on the query path, qualified with its name.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerRecord {
    pub name: String,
    pub rtype: String,
    pub content: String,
    pub ttl: i32,
}

/// Per-publisher account state.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountInfo {
    key_hash: String,
    next_sequence: i64,
    domain_suffix: String,
    last_update_millis: i64,
    soa_ttl: i32,
    contact: String,
    subdomains: Vec<String>,
}

impl AccountInfo {
    /// A fresh account publishes under `<hash>.<suffix base>` until it
    /// validates a suffix of its own.
    pub fn new(key_hash: &str, suffix_base: &str) -> AccountInfo {
        AccountInfo {
            key_hash: key_hash.to_string(),
            next_sequence: 0,
            domain_suffix: format!("{}.{}", key_hash, suffix_base),
            last_update_millis: chrono::Utc::now().timestamp_millis(),
            soa_ttl: DEFAULT_SOA_TTL,
            contact: format!("admin@{}", suffix_base),
            subdomains: Vec::new(),
        }
    }

    pub fn key_hash(&self) -> &str {
        &self.key_hash
    }

    pub fn sequence_number(&self) -> i64 {
        self.next_sequence
    }

    pub fn increment_sequence(&mut self) {
        self.next_sequence += 1;
    }

    pub fn domain_suffix(&self) -> &str {
        &self.domain_suffix
    }

    pub fn soa_ttl(&self) -> i32 {
        self.soa_ttl
    }

    pub fn contact(&self) -> &str {
        &self.contact
    }

    pub fn subdomains(&self) -> &[String] {
        &self.subdomains
    }

    pub fn add_subdomain(&mut self, subdomain: &str) {
        if !self.subdomains.iter().any(|s| s == subdomain) {
            self.subdomains.push(subdomain.to_string());
        }
    }

    pub fn set_domain_suffix(&mut self, new_suffix: &str, soa_ttl: i32, contact: &str) {
        self.domain_suffix = new_suffix.to_string();
        self.soa_ttl = soa_ttl;
        self.contact = contact.to_string();
        self.last_update_millis = chrono::Utc::now().timestamp_millis();
    }

    /// SOA serial derived from the last update time, `yymmddHHMM`.
    pub fn soa_serial(&self) -> String {
        match chrono::Utc.timestamp_millis_opt(self.last_update_millis).single() {
            Some(when) => when.format("%y%m%d%H%M").to_string(),
            None => "0".to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&hex::decode(&self.key_hash)?);
        put_i64(&mut out, self.next_sequence);
        put_string(&mut out, &self.domain_suffix);
        put_i64(&mut out, self.last_update_millis);
        put_i32(&mut out, self.soa_ttl);
        put_string(&mut out, &self.contact);
        put_i32(&mut out, self.subdomains.len() as i32);
        for subdomain in &self.subdomains {
            put_string(&mut out, subdomain);
        }
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<AccountInfo> {
        let mut reader = PersistedReader::new(data);
        let key_hash = hex::encode(reader.take(20)?);
        let next_sequence = reader.i64()?;
        let domain_suffix = reader.string()?;
        let last_update_millis = reader.i64()?;
        let soa_ttl = reader.i32()?;
        let contact = reader.string()?;
        let count = reader.i32()?;
        let mut subdomains = Vec::new();
        for _ in 0..count {
            subdomains.push(reader.string()?);
        }
        Ok(AccountInfo {
            key_hash,
            next_sequence,
            domain_suffix,
            last_update_millis,
            soa_ttl,
            contact,
            subdomains,
        })
    }
}

/// The record set published under one fully-qualified name.
#[derive(Debug, Clone, PartialEq)]
pub struct SubdomainInfo {
    fqdn: String,
    account_hash: String,
    mutation_counter: i64,
    records: Vec<StoredRecord>,
}

impl SubdomainInfo {
    pub fn new(fqdn: &str, account_hash: &str) -> SubdomainInfo {
        SubdomainInfo {
            fqdn: fqdn.to_string(),
            account_hash: account_hash.to_string(),
            mutation_counter: 0,
            records: Vec::new(),
        }
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    pub fn account_hash(&self) -> &str {
        &self.account_hash
    }

    pub fn mutation_counter(&self) -> i64 {
        self.mutation_counter
    }

    pub fn records(&self) -> &[StoredRecord] {
        &self.records
    }

    /// Upsert a record. A record with the same (type, content) pair already
    /// present only has its TTL and attributes replaced; the mutation
    /// counter advances only on a true append.
    pub fn add_record(&mut self, rtype: &str, content: &str, ttl: i32, attrs: &[RecordAttribute]) {
        for record in &mut self.records {
            if record.rtype == rtype && record.content == content {
                record.ttl = ttl;
                record.attributes = attrs.to_vec();
                return;
            }
        }
        self.mutation_counter += 1;
        self.records.push(StoredRecord {
            rtype: rtype.to_string(),
            content: content.to_string(),
            ttl,
            attributes: attrs.to_vec(),
        });
    }

    /// Remove records matching the (type, content) filter; an empty string
    /// on either side is a wildcard.
    pub fn delete_records(&mut self, rtype: &str, content: &str) {
        self.records.retain(|record| {
            let type_matches = rtype.is_empty() || record.rtype == rtype;
            let content_matches = content.is_empty() || record.content == content;
            !(type_matches && content_matches)
        });
        self.mutation_counter += 1;
    }

    /// Move this subdomain under a validated suffix. The current name must
    /// sit exactly under `expected_suffix` (the account's auto-assigned
    /// one); anything else means the account was already validated, and the
    /// rewrite is refused rather than mangling a vanity name.
    pub fn replace_suffix(&mut self, expected_suffix: &str, new_suffix: &str) -> Result<()> {
        if self.fqdn == expected_suffix {
            self.fqdn = new_suffix.to_string();
            return Ok(());
        }
        let tail = format!(".{}", expected_suffix);
        match self.fqdn.strip_suffix(&tail) {
            Some(prefix) => {
                self.fqdn = format!("{}.{}", prefix, new_suffix);
                Ok(())
            }
            None => {
                log::error!(
                    "refusing suffix rewrite: {} is not under {}",
                    self.fqdn,
                    expected_suffix
                );
                Err(StoreError::SuffixMismatch)
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        put_string(&mut out, &self.fqdn);
        put_i64(&mut out, self.mutation_counter);
        put_i32(&mut out, self.records.len() as i32);
        for record in &self.records {
            put_string(&mut out, &record.rtype);
            put_string(&mut out, &record.content);
            put_i32(&mut out, record.ttl);
            put_i32(&mut out, record.attributes.len() as i32);
            for attr in &record.attributes {
                let payload = attr.payload();
                put_i32(&mut out, i32::from(attr.type_id));
                put_i32(&mut out, payload.len() as i32);
                out.extend_from_slice(&payload);
            }
        }
        out.extend_from_slice(&hex::decode(&self.account_hash)?);
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<SubdomainInfo> {
        let mut reader = PersistedReader::new(data);
        let fqdn = reader.string()?;
        let mutation_counter = reader.i64()?;
        let record_count = reader.i32()?;
        let mut records = Vec::new();
        for _ in 0..record_count {
            let rtype = reader.string()?;
            let content = reader.string()?;
            let ttl = reader.i32()?;
            let attr_count = reader.i32()?;
            let mut attributes = Vec::new();
            for _ in 0..attr_count {
                let type_id = reader.i32()? as u16;
                let len = reader.i32()? as usize;
                let payload = reader.take(len)?;
                if let Some(attr) = RecordAttribute::from_persisted(type_id, payload) {
                    attributes.push(attr);
                }
            }
            records.push(StoredRecord {
                rtype,
                content,
                ttl,
                attributes,
            });
        }
        let account_hash = hex::encode(reader.take(20)?);
        Ok(SubdomainInfo {
            fqdn,
            account_hash,
            mutation_counter,
            records,
        })
    }
}

/// Guard over one account's lock slot; held for the lifetime of a bind.
pub type AccountGuard = ArcMutexGuard<RawMutex, ()>;

/// The working copy of an account while a packet is being processed. Created
/// by [`Backend::bind`] and consumed by [`Backend::unbind`], so backend
/// mutations without a bind cannot be expressed.
pub struct BoundAccount {
    pub account: AccountInfo,
    dirty: bool,
    _guard: Option<AccountGuard>,
}

impl BoundAccount {
    pub fn new(account: AccountInfo, guard: Option<AccountGuard>) -> BoundAccount {
        BoundAccount {
            account,
            dirty: false,
            _guard: guard,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Advance the account's sequence number; takes effect at unbind.
    pub fn increment_sequence_number(&mut self) {
        self.account.increment_sequence();
        self.dirty = true;
    }
}

/// Capability contract every storage adapter satisfies. The replicated
/// key/value adapter lives in this crate; a relational adapter is an
/// external concern bound only by this trait.
pub trait Backend: Send + Sync {
    /// Create the account if this key hash has never been seen. Idempotent.
    fn assure_account(&self, key_hash: &str) -> Result<()>;

    /// The account's next expected sequence number; readable without a bind.
    fn sequence_number(&self, key_hash: &str) -> Result<i64>;

    /// Take exclusive ownership of an account and load its working copy.
    fn bind(&self, key_hash: &str) -> Result<BoundAccount>;

    /// Persist the working copy if it was mutated and release the account.
    fn unbind(&self, bound: BoundAccount) -> Result<()>;

    /// Upsert one record under the account's suffix per
    /// [`SubdomainInfo::add_record`]. An empty subdomain targets the apex.
    fn add_record(
        &self,
        bound: &mut BoundAccount,
        subdomain: &str,
        rtype: &str,
        content: &str,
        ttl: i32,
        attrs: &[RecordAttribute],
    ) -> Result<()>;

    /// Delete matching records; empty type or content act as wildcards.
    fn delete_records(
        &self,
        bound: &mut BoundAccount,
        subdomain: &str,
        rtype: &str,
        content: &str,
    ) -> Result<()>;

    /// Move the account and every subdomain it owns from the auto-assigned
    /// suffix to a validated one.
    fn update_suffix(&self, bound: &mut BoundAccount, new_suffix: &str) -> Result<()>;

    /// Read path: every record published under `qname`, filtered by type
    /// unless the query asks for ANY. Only class IN is answered. An SOA
    /// query synthesizes the record from account metadata.
    fn answer_query(&self, qname: &str, qclass: &str, qtype: &str) -> Result<Vec<AnswerRecord>>;
}

/// Build the SOA answer for an account, used by backends on the query path.
pub fn synthesize_soa(qname: &str, account: &AccountInfo, suffix_base: &str) -> AnswerRecord {
    AnswerRecord {
        name: qname.to_string(),
        rtype: "SOA".to_string(),
        content: format!(
            "ns1.{} {} {} 10800 3600 604800 3600",
            suffix_base,
            account.contact(),
            account.soa_serial()
        ),
        ttl: account.soa_ttl(),
    }
}

/// The SOA metadata installed when a VALIDATE succeeds.
pub fn validated_contact(suffix_base: &str) -> (i32, String) {
    (VALIDATED_SOA_TTL, format!("admin@{}", suffix_base))
}
