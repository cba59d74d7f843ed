use super::Directory;

/// Local part of the email, lower-cased. `"user"` if it is somehow empty.
pub fn username_base(email: &str) -> String {
    let local = email.split('@').next().unwrap_or_default().trim().to_lowercase();
    if local.is_empty() { "user".to_string() } else { local }
}

/// Hands out unique usernames: the base itself if free, else the base with
/// the smallest numeric suffix from 2 that is free both in the directory and
/// in this batch.
pub struct UsernameAllocator<'a, D: Directory + ?Sized> {
    dir: &'a D,
    issued: Vec<String>,
}

impl<'a, D: Directory + ?Sized> UsernameAllocator<'a, D> {
    pub fn new(dir: &'a D) -> Self {
        Self { dir, issued: Vec::new() }
    }

    fn is_free(&self, candidate: &str) -> bool {
        !self.dir.username_taken(candidate) && !self.issued.iter().any(|u| u == candidate)
    }

    pub fn allocate(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut suffix = 2u32;
        while !self.is_free(&candidate) {
            candidate = format!("{base}{suffix}");
            suffix += 1;
        }
        self.issued.push(candidate.clone());
        candidate
    }

    pub fn savepoint(&self) -> usize {
        self.issued.len()
    }

    pub fn rollback(&mut self, sp: usize) {
        self.issued.truncate(sp);
    }
}
