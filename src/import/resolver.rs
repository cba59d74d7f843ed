use std::collections::HashMap;

use ulid::Ulid;

use crate::model::{class_name, radio_team_name};

/// Read access to persisted natural keys.
pub trait Directory {
    fn find_class(&self, start_year: i32, section: &str) -> Option<Ulid>;
    fn find_team(&self, name: &str) -> Option<Ulid>;
    /// `name` is the display name, `"{start_year} {code}"`.
    fn find_radio_team(&self, name: &str) -> Option<Ulid>;
    fn email_taken(&self, email: &str) -> bool;
    fn username_taken(&self, username: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    Class { start_year: i32, section: String },
    Team(String),
    RadioTeam { start_year: i32, code: String },
}

impl NaturalKey {
    pub fn display_name(&self) -> String {
        match self {
            NaturalKey::Class { start_year, section } => class_name(*start_year, section),
            NaturalKey::Team(name) => name.clone(),
            NaturalKey::RadioTeam { start_year, code } => radio_team_name(*start_year, code),
        }
    }
}

/// Outcome of resolving one key for one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub key: NaturalKey,
    pub id: Ulid,
    /// This row mints the entity; it must write the creation record.
    pub created: bool,
}

/// Batch-scoped create-or-reuse cache.
///
/// Keys minted earlier in the batch win over the directory, so a key is
/// created at most once per batch and later rows reuse it.
pub struct Resolver<'a, D: Directory + ?Sized> {
    dir: &'a D,
    minted: HashMap<NaturalKey, Ulid>,
    created: Vec<(NaturalKey, Ulid)>,
    reused: Vec<(NaturalKey, Ulid)>,
}

/// Positions to rewind to when a row fails.
#[derive(Debug, Clone, Copy)]
pub struct Savepoint {
    created: usize,
    reused: usize,
}

impl<'a, D: Directory + ?Sized> Resolver<'a, D> {
    pub fn new(dir: &'a D) -> Self {
        Self {
            dir,
            minted: HashMap::new(),
            created: Vec::new(),
            reused: Vec::new(),
        }
    }

    fn lookup(&self, key: &NaturalKey) -> Option<Ulid> {
        match key {
            NaturalKey::Class { start_year, section } => self.dir.find_class(*start_year, section),
            NaturalKey::Team(name) => self.dir.find_team(name),
            NaturalKey::RadioTeam { .. } => self.dir.find_radio_team(&key.display_name()),
        }
    }

    /// `(id, was_created)`; `was_created` only for the first reference in the batch.
    pub fn resolve_or_create(&mut self, key: &NaturalKey) -> (Ulid, bool) {
        if let Some(id) = self.minted.get(key) {
            return (*id, false);
        }
        if let Some(id) = self.lookup(key) {
            if !self.reused.iter().any(|(k, _)| k == key) {
                self.reused.push((key.clone(), id));
            }
            return (id, false);
        }
        let id = Ulid::new();
        self.minted.insert(key.clone(), id);
        self.created.push((key.clone(), id));
        (id, true)
    }

    pub fn resolve(&mut self, key: NaturalKey) -> Resolved {
        let (id, created) = self.resolve_or_create(&key);
        Resolved { key, id, created }
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            created: self.created.len(),
            reused: self.reused.len(),
        }
    }

    /// Forget everything resolved since `sp`.
    pub fn rollback(&mut self, sp: Savepoint) {
        for (key, _) in self.created.drain(sp.created..) {
            self.minted.remove(&key);
        }
        self.reused.truncate(sp.reused);
    }

    pub fn created(&self) -> &[(NaturalKey, Ulid)] {
        &self.created
    }

    pub fn reused(&self) -> &[(NaturalKey, Ulid)] {
        &self.reused
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    /// In-memory directory for import tests.
    #[derive(Default)]
    pub(crate) struct FakeDirectory {
        pub classes: HashMap<(i32, String), Ulid>,
        pub teams: HashMap<String, Ulid>,
        pub radio_teams: HashMap<String, Ulid>,
        pub emails: HashSet<String>,
        pub usernames: HashSet<String>,
    }

    impl Directory for FakeDirectory {
        fn find_class(&self, start_year: i32, section: &str) -> Option<Ulid> {
            self.classes.get(&(start_year, section.to_string())).copied()
        }
        fn find_team(&self, name: &str) -> Option<Ulid> {
            self.teams.get(name).copied()
        }
        fn find_radio_team(&self, name: &str) -> Option<Ulid> {
            self.radio_teams.get(name).copied()
        }
        fn email_taken(&self, email: &str) -> bool {
            self.emails.contains(&email.to_lowercase())
        }
        fn username_taken(&self, username: &str) -> bool {
            self.usernames.contains(username)
        }
    }

    fn team(name: &str) -> NaturalKey {
        NaturalKey::Team(name.into())
    }

    #[test]
    fn new_key_is_created_once_per_batch() {
        let dir = FakeDirectory::default();
        let mut r = Resolver::new(&dir);
        let (a, created_a) = r.resolve_or_create(&team("A"));
        let (b, created_b) = r.resolve_or_create(&team("A"));
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a, b);
        assert_eq!(r.created().len(), 1);
        assert!(r.reused().is_empty());
    }

    #[test]
    fn existing_key_is_reused() {
        let mut dir = FakeDirectory::default();
        let existing = Ulid::new();
        dir.classes.insert((2024, "F".into()), existing);
        let mut r = Resolver::new(&dir);
        let key = NaturalKey::Class { start_year: 2024, section: "F".into() };
        assert_eq!(r.resolve_or_create(&key), (existing, false));
        assert_eq!(r.resolve_or_create(&key), (existing, false));
        assert_eq!(r.reused().len(), 1);
        assert_eq!(r.reused()[0].0.display_name(), "2024F");
    }

    #[test]
    fn radio_team_looked_up_by_display_name() {
        let mut dir = FakeDirectory::default();
        let existing = Ulid::new();
        dir.radio_teams.insert("2025 A1".into(), existing);
        let mut r = Resolver::new(&dir);
        let key = NaturalKey::RadioTeam { start_year: 2025, code: "A1".into() };
        assert_eq!(r.resolve_or_create(&key).0, existing);
    }

    #[test]
    fn rollback_forgets_row_resolutions() {
        let dir = FakeDirectory::default();
        let mut r = Resolver::new(&dir);
        let (kept, _) = r.resolve_or_create(&team("A"));
        let sp = r.savepoint();
        let (dropped, created) = r.resolve_or_create(&team("B"));
        assert!(created);
        r.rollback(sp);

        assert_eq!(r.created().len(), 1);
        assert_eq!(r.resolve_or_create(&team("A")), (kept, false));
        let (again, created_again) = r.resolve_or_create(&team("B"));
        assert!(created_again);
        assert_ne!(again, dropped);
    }
}
