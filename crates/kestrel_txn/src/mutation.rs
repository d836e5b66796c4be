//! Binlog mutation buffer.
//!
//! Each statement accumulates per-table row mutations; on statement commit
//! they are merged into the session-level prewrite value that the binlog
//! pump ships at transaction commit.

use serde::{Deserialize, Serialize};

use kestrel_common::types::TableId;

/// Order marker for replaying a table's mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    Insert,
    Update,
    DeleteId,
    DeletePk,
    DeleteRow,
}

/// Row mutations of a single table within one statement or transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMutation {
    pub table_id: TableId,
    pub inserted_rows: Vec<Vec<u8>>,
    pub updated_rows: Vec<Vec<u8>>,
    pub deleted_ids: Vec<i64>,
    pub deleted_pks: Vec<Vec<u8>>,
    pub deleted_rows: Vec<Vec<u8>>,
    pub sequence: Vec<MutationKind>,
}

impl TableMutation {
    pub fn new(table_id: TableId) -> TableMutation {
        TableMutation {
            table_id,
            ..TableMutation::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Append all of `other`'s mutations, preserving their order.
    pub fn merge_from(&mut self, other: &TableMutation) {
        self.inserted_rows.extend(other.inserted_rows.iter().cloned());
        self.updated_rows.extend(other.updated_rows.iter().cloned());
        self.deleted_ids.extend(other.deleted_ids.iter().copied());
        self.deleted_pks.extend(other.deleted_pks.iter().cloned());
        self.deleted_rows.extend(other.deleted_rows.iter().cloned());
        self.sequence.extend(other.sequence.iter().copied());
    }

    pub fn push_insert(&mut self, row: Vec<u8>) {
        self.inserted_rows.push(row);
        self.sequence.push(MutationKind::Insert);
    }

    pub fn push_update(&mut self, row: Vec<u8>) {
        self.updated_rows.push(row);
        self.sequence.push(MutationKind::Update);
    }

    pub fn push_delete_id(&mut self, id: i64) {
        self.deleted_ids.push(id);
        self.sequence.push(MutationKind::DeleteId);
    }
}

/// Session-level binlog prewrite accumulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrewriteValue {
    pub schema_version: i64,
    pub mutations: Vec<TableMutation>,
}

impl PrewriteValue {
    /// The mutation record for `table_id`, appended if absent.
    pub fn mutation_for(&mut self, table_id: TableId) -> &mut TableMutation {
        if let Some(idx) = self.mutations.iter().position(|m| m.table_id == table_id) {
            return &mut self.mutations[idx];
        }
        self.mutations.push(TableMutation::new(table_id));
        self.mutations.last_mut().expect("just pushed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_preserves_order() {
        let mut a = TableMutation::new(TableId(1));
        a.push_insert(b"r1".to_vec());
        let mut b = TableMutation::new(TableId(1));
        b.push_delete_id(7);
        b.push_insert(b"r2".to_vec());
        a.merge_from(&b);
        assert_eq!(
            a.sequence,
            vec![
                MutationKind::Insert,
                MutationKind::DeleteId,
                MutationKind::Insert
            ]
        );
        assert_eq!(a.inserted_rows, vec![b"r1".to_vec(), b"r2".to_vec()]);
        assert_eq!(a.deleted_ids, vec![7]);
    }

    #[test]
    fn test_mutation_for_reuses_entry() {
        let mut pv = PrewriteValue::default();
        pv.mutation_for(TableId(1)).push_insert(b"a".to_vec());
        pv.mutation_for(TableId(2)).push_insert(b"b".to_vec());
        pv.mutation_for(TableId(1)).push_insert(b"c".to_vec());
        assert_eq!(pv.mutations.len(), 2);
        assert_eq!(pv.mutations[0].inserted_rows.len(), 2);
    }
}
