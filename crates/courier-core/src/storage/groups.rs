//! Group Storage

use redb::{ReadableTable, TableDefinition};

use crate::error::CourierResult;
use crate::types::{Group, Identity};

use super::{decode, encode, GroupStore, RedbRepository, RepoChange};

/// Table for groups (key: group identity, value: serialized Group)
pub(crate) const GROUPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

impl GroupStore for RedbRepository {
    fn save_group(&self, group: &Group) -> CourierResult<()> {
        self.write(|txn, changes| {
            {
                let mut table = txn.open_table(GROUPS_TABLE)?;
                let data = encode(group)?;
                table.insert(group.id.as_str(), data.as_slice())?;
            }
            changes.push(RepoChange::Group(group.id.clone()));
            Ok(())
        })
    }

    fn group(&self, id: &Identity) -> CourierResult<Option<Group>> {
        self.read(|txn| {
            let table = txn.open_table(GROUPS_TABLE)?;
            match table.get(id.as_str())? {
                Some(data) => Ok(Some(decode(data.value())?)),
                None => Ok(None),
            }
        })
    }

    fn groups(&self) -> CourierResult<Vec<Group>> {
        self.read(|txn| {
            let table = txn.open_table(GROUPS_TABLE)?;
            let mut groups = Vec::new();
            for entry in table.iter()? {
                let (_, data) = entry?;
                groups.push(decode(data.value())?);
            }
            Ok(groups)
        })
    }
}
