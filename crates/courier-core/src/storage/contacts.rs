//! Contact Storage - address book, synced contacts and own profile
//!
//! A contact sync replaces the whole synced contact table: the syncer marks
//! the table ([`ContactStore::begin_resync`]), deletes what the previous sync
//! materialized, applies the new batch and clears the mark. A mark that is
//! still set on startup means the last sync never finished.

use redb::{ReadableTable, TableDefinition};
use tracing::warn;

use crate::error::CourierResult;
use crate::types::{AddressBookEntry, BatchOutcome, Contact, ContactOp, Identity};

use super::{decode, encode, ContactStore, RedbRepository, RepoChange, META_TABLE, RESYNC_PENDING};

/// Table for synced contacts (key: identity, value: serialized Contact)
pub(crate) const CONTACTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("contacts");

/// Table for our own profile (single key `self`)
pub(crate) const PROFILE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("profile");

/// Table for the local address book (key: lookup key, value: serialized AddressBookEntry)
pub(crate) const ADDRESS_BOOK_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("address_book");

const PROFILE_KEY: &str = "self";

fn is_valid(contact: &Contact) -> bool {
    !contact.identity.is_empty() && contact.identity.as_str().contains('@')
}

impl ContactStore for RedbRepository {
    fn add_address_book_entry(&self, entry: &AddressBookEntry) -> CourierResult<()> {
        self.write(|txn, _| {
            let mut table = txn.open_table(ADDRESS_BOOK_TABLE)?;
            let data = encode(entry)?;
            table.insert(entry.lookup_key.as_str(), data.as_slice())?;
            Ok(())
        })
    }

    fn sync_candidates(&self) -> CourierResult<Vec<AddressBookEntry>> {
        self.read(|txn| {
            let table = txn.open_table(ADDRESS_BOOK_TABLE)?;
            let mut entries = Vec::new();
            for entry in table.iter()? {
                let (_, data) = entry?;
                entries.push(decode(data.value())?);
            }
            Ok(entries)
        })
    }

    fn begin_resync(&self) -> CourierResult<()> {
        self.write(|txn, _| {
            let mut meta = txn.open_table(META_TABLE)?;
            meta.insert(RESYNC_PENDING, 1)?;
            Ok(())
        })
    }

    fn is_resync_pending(&self) -> CourierResult<bool> {
        self.read(|txn| {
            let meta = txn.open_table(META_TABLE)?;
            let pending = meta.get(RESYNC_PENDING)?.map(|v| v.value() != 0);
            Ok(pending.unwrap_or(false))
        })
    }

    fn delete_synced_contacts(&self) -> CourierResult<usize> {
        self.write(|txn, changes| {
            let mut table = txn.open_table(CONTACTS_TABLE)?;
            let keys: Vec<String> = table
                .iter()?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()?;
            for key in &keys {
                table.remove(key.as_str())?;
            }
            if !keys.is_empty() {
                changes.push(RepoChange::Contacts);
            }
            Ok(keys.len())
        })
    }

    fn apply_contact_batch(&self, ops: &[ContactOp]) -> CourierResult<BatchOutcome> {
        self.write(|txn, changes| {
            let mut outcome = BatchOutcome::default();
            {
                let mut contacts = txn.open_table(CONTACTS_TABLE)?;
                let mut profile = txn.open_table(PROFILE_TABLE)?;
                for op in ops {
                    let contact = op.contact();
                    if !is_valid(contact) {
                        warn!(identity = %contact.identity, "Skipping invalid contact entry");
                        outcome.skipped += 1;
                        continue;
                    }
                    let data = encode(contact)?;
                    match op {
                        ContactOp::Upsert(_) => {
                            contacts.insert(contact.identity.as_str(), data.as_slice())?;
                        }
                        ContactOp::Profile(_) => {
                            profile.insert(PROFILE_KEY, data.as_slice())?;
                        }
                    }
                    outcome.applied += 1;
                }
            }
            if outcome.applied > 0 {
                changes.push(RepoChange::Contacts);
            }
            Ok(outcome)
        })
    }

    fn commit_resync(&self) -> CourierResult<()> {
        self.write(|txn, _| {
            let mut meta = txn.open_table(META_TABLE)?;
            meta.remove(RESYNC_PENDING)?;
            Ok(())
        })
    }

    fn contact(&self, identity: &Identity) -> CourierResult<Option<Contact>> {
        self.read(|txn| {
            let table = txn.open_table(CONTACTS_TABLE)?;
            match table.get(identity.as_str())? {
                Some(data) => Ok(Some(decode(data.value())?)),
                None => Ok(None),
            }
        })
    }

    fn contacts(&self) -> CourierResult<Vec<Contact>> {
        self.read(|txn| {
            let table = txn.open_table(CONTACTS_TABLE)?;
            let mut contacts = Vec::new();
            for entry in table.iter()? {
                let (_, data) = entry?;
                contacts.push(decode(data.value())?);
            }
            Ok(contacts)
        })
    }

    fn profile(&self) -> CourierResult<Option<Contact>> {
        self.read(|txn| {
            let table = txn.open_table(PROFILE_TABLE)?;
            match table.get(PROFILE_KEY)? {
                Some(data) => Ok(Some(decode(data.value())?)),
                None => Ok(None),
            }
        })
    }

    fn mark_registered(&self, identity: &Identity) -> CourierResult<bool> {
        self.write(|txn, changes| {
            let mut table = txn.open_table(CONTACTS_TABLE)?;
            let existing = table.get(identity.as_str())?.map(|v| v.value().to_vec());
            let Some(data) = existing else {
                return Ok(false);
            };
            let mut contact: Contact = decode(&data)?;
            if !contact.registered {
                contact.registered = true;
                let data = encode(&contact)?;
                table.insert(identity.as_str(), data.as_slice())?;
                changes.push(RepoChange::Contacts);
            }
            Ok(true)
        })
    }
}
