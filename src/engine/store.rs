use dashmap::DashMap;
use ulid::Ulid;

use crate::import::Directory;
use crate::model::*;

/// Directory records and their natural-key indexes.
///
/// Emails are indexed lower-cased; team and radio-team names exactly as
/// stored (trimmed). Writers are serialised by the engine's directory lock,
/// so index and record updates never interleave.
pub struct DirectoryStore {
    persons: DashMap<Ulid, Person>,
    person_by_email: DashMap<String, Ulid>,
    person_by_username: DashMap<String, Ulid>,
    classes: DashMap<Ulid, SchoolClass>,
    class_by_key: DashMap<(i32, String), Ulid>,
    teams: DashMap<Ulid, Team>,
    team_by_name: DashMap<String, Ulid>,
    radio_teams: DashMap<Ulid, RadioTeam>,
    radio_team_by_name: DashMap<String, Ulid>,
    equipment: DashMap<Ulid, Equipment>,
}

impl Default for DirectoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_by_name<T: Clone>(items: impl Iterator<Item = T>, name: impl Fn(&T) -> String) -> Vec<T> {
    let mut v: Vec<T> = items.collect();
    v.sort_by_key(|item| name(item));
    v
}

impl DirectoryStore {
    pub fn new() -> Self {
        Self {
            persons: DashMap::new(),
            person_by_email: DashMap::new(),
            person_by_username: DashMap::new(),
            classes: DashMap::new(),
            class_by_key: DashMap::new(),
            teams: DashMap::new(),
            team_by_name: DashMap::new(),
            radio_teams: DashMap::new(),
            radio_team_by_name: DashMap::new(),
            equipment: DashMap::new(),
        }
    }

    // ── Persons ──────────────────────────────────────────────

    pub fn insert_person(&self, person: Person) {
        self.person_by_email
            .insert(person.email.to_lowercase(), person.id);
        self.person_by_username
            .insert(person.username.clone(), person.id);
        self.persons.insert(person.id, person);
    }

    pub fn set_person_active(&self, id: Ulid, active: bool) {
        if let Some(mut p) = self.persons.get_mut(&id) {
            p.active = active;
        }
    }

    pub fn get_person(&self, id: &Ulid) -> Option<Person> {
        self.persons.get(id).map(|p| p.clone())
    }

    pub fn person_by_email(&self, email: &str) -> Option<Person> {
        let id = *self.person_by_email.get(&email.to_lowercase())?;
        self.get_person(&id)
    }

    pub fn person_count(&self) -> usize {
        self.persons.len()
    }

    pub fn persons(&self) -> Vec<Person> {
        sorted_by_name(self.persons.iter().map(|e| e.value().clone()), |p| p.full_name())
    }

    // ── Classes ──────────────────────────────────────────────

    pub fn insert_class(&self, class: SchoolClass) {
        self.class_by_key
            .insert((class.start_year, class.section.clone()), class.id);
        self.classes.insert(class.id, class);
    }

    pub fn add_class_teacher(&self, class_id: Ulid, person_id: Ulid) {
        if let Some(mut class) = self.classes.get_mut(&class_id)
            && !class.teachers.contains(&person_id)
        {
            class.teachers.push(person_id);
        }
    }

    pub fn get_class(&self, id: &Ulid) -> Option<SchoolClass> {
        self.classes.get(id).map(|c| c.clone())
    }

    pub fn class_id(&self, start_year: i32, section: &str) -> Option<Ulid> {
        self.class_by_key
            .get(&(start_year, section.to_string()))
            .map(|e| *e.value())
    }

    pub fn classes(&self) -> Vec<SchoolClass> {
        sorted_by_name(self.classes.iter().map(|e| e.value().clone()), SchoolClass::name)
    }

    // ── Teams ────────────────────────────────────────────────

    pub fn insert_team(&self, team: Team) {
        self.team_by_name.insert(team.name.clone(), team.id);
        self.teams.insert(team.id, team);
    }

    pub fn get_team(&self, id: &Ulid) -> Option<Team> {
        self.teams.get(id).map(|t| t.clone())
    }

    pub fn team_id(&self, name: &str) -> Option<Ulid> {
        self.team_by_name.get(name).map(|e| *e.value())
    }

    pub fn teams(&self) -> Vec<Team> {
        sorted_by_name(self.teams.iter().map(|e| e.value().clone()), |t| t.name.clone())
    }

    pub fn insert_radio_team(&self, radio_team: RadioTeam) {
        self.radio_team_by_name
            .insert(radio_team.name(), radio_team.id);
        self.radio_teams.insert(radio_team.id, radio_team);
    }

    pub fn get_radio_team(&self, id: &Ulid) -> Option<RadioTeam> {
        self.radio_teams.get(id).map(|t| t.clone())
    }

    pub fn radio_team_id(&self, name: &str) -> Option<Ulid> {
        self.radio_team_by_name.get(name).map(|e| *e.value())
    }

    pub fn radio_teams(&self) -> Vec<RadioTeam> {
        sorted_by_name(self.radio_teams.iter().map(|e| e.value().clone()), RadioTeam::name)
    }

    // ── Equipment ────────────────────────────────────────────

    pub fn insert_equipment(&self, equipment: Equipment) {
        self.equipment.insert(equipment.id, equipment);
    }

    pub fn set_equipment_functional(&self, id: Ulid, functional: bool) {
        if let Some(mut e) = self.equipment.get_mut(&id) {
            e.functional = functional;
        }
    }

    pub fn get_equipment(&self, id: &Ulid) -> Option<Equipment> {
        self.equipment.get(id).map(|e| e.clone())
    }

    pub fn equipment(&self) -> Vec<Equipment> {
        sorted_by_name(self.equipment.iter().map(|e| e.value().clone()), |e| e.nickname.clone())
    }
}

impl Directory for DirectoryStore {
    fn find_class(&self, start_year: i32, section: &str) -> Option<Ulid> {
        self.class_id(start_year, section)
    }

    fn find_team(&self, name: &str) -> Option<Ulid> {
        self.team_id(name)
    }

    fn find_radio_team(&self, name: &str) -> Option<Ulid> {
        self.radio_team_id(name)
    }

    fn email_taken(&self, email: &str) -> bool {
        self.person_by_email.contains_key(&email.to_lowercase())
    }

    fn username_taken(&self, username: &str) -> bool {
        self.person_by_username.contains_key(username)
    }
}
