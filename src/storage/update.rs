//! # Mises à jour parcellaires typées
//!
//! Plutôt qu'une méthode « has-field? » par colonne, une mise à jour est
//! une application parcellaire `{champ -> valeur}` avec identifiants de
//! champ typés; les stores la traduisent vers leur syntaxe native.

use std::collections::BTreeMap;

/// Champs modifiables de l'enregistrement de séquences d'une conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SeqField {
    MaxSeq,
    MinSeq,
}

impl SeqField {
    /// Nom de colonne côté store SQL
    pub fn column(&self) -> &'static str {
        match self {
            SeqField::MaxSeq => "max_seq",
            SeqField::MinSeq => "min_seq",
        }
    }
}

/// Mise à jour parcellaire d'un enregistrement de séquences
#[derive(Debug, Clone, Default)]
pub struct SeqRecordUpdate {
    entries: BTreeMap<SeqField, i64>,
}

impl SeqRecordUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nombre de champs portés par la mise à jour
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn with_max_seq(mut self, value: i64) -> Self {
        self.entries.insert(SeqField::MaxSeq, value);
        self
    }

    pub fn with_min_seq(mut self, value: i64) -> Self {
        self.entries.insert(SeqField::MinSeq, value);
        self
    }

    pub fn del_max_seq(mut self) -> Self {
        self.entries.remove(&SeqField::MaxSeq);
        self
    }

    pub fn del_min_seq(mut self) -> Self {
        self.entries.remove(&SeqField::MinSeq);
        self
    }

    pub fn has_max_seq(&self) -> bool {
        self.entries.contains_key(&SeqField::MaxSeq)
    }

    pub fn has_min_seq(&self) -> bool {
        self.entries.contains_key(&SeqField::MinSeq)
    }

    pub fn get_max_seq(&self) -> Option<i64> {
        self.entries.get(&SeqField::MaxSeq).copied()
    }

    pub fn get_min_seq(&self) -> Option<i64> {
        self.entries.get(&SeqField::MinSeq).copied()
    }

    /// Itère sur les champs dans un ordre stable
    pub fn entries(&self) -> impl Iterator<Item = (SeqField, i64)> + '_ {
        self.entries.iter().map(|(field, value)| (*field, *value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_accessors() {
        let update = SeqRecordUpdate::new().with_min_seq(7);
        assert_eq!(update.len(), 1);
        assert!(update.has_min_seq());
        assert!(!update.has_max_seq());
        assert_eq!(update.get_min_seq(), Some(7));
        assert_eq!(update.get_max_seq(), None);
    }

    #[test]
    fn test_del_and_overwrite() {
        let update = SeqRecordUpdate::new()
            .with_min_seq(7)
            .with_max_seq(100)
            .with_min_seq(9)
            .del_max_seq();
        assert_eq!(update.get_min_seq(), Some(9));
        assert!(!update.is_empty());
        assert_eq!(update.len(), 1);
    }

    #[test]
    fn test_stable_entry_order() {
        let update = SeqRecordUpdate::new().with_min_seq(2).with_max_seq(10);
        let fields: Vec<_> = update.entries().map(|(f, _)| f.column()).collect();
        assert_eq!(fields, vec!["max_seq", "min_seq"]);
    }
}
