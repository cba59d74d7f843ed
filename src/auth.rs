/// Shared-password check for the `auth` handshake.
#[derive(Debug, Clone)]
pub struct SharedPassword {
    password: String,
}

impl SharedPassword {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }

    /// Compares every byte regardless of where the first mismatch is.
    pub fn verify(&self, candidate: &str) -> bool {
        let expected = self.password.as_bytes();
        let given = candidate.as_bytes();
        let mut diff = expected.len() ^ given.len();
        for (i, b) in expected.iter().enumerate() {
            diff |= (*b ^ given.get(i).copied().unwrap_or(0)) as usize;
        }
        diff == 0
    }
}
