use dashmap::DashMap;
use ulid::Ulid;

use super::SharedCourtState;

/// Court states plus the lookup indexes every operation needs.
pub struct InMemoryStore {
    courts: DashMap<Ulid, SharedCourtState>,
    /// Booking / block / series / waitlist entry id → court id.
    entity_to_court: DashMap<Ulid, Ulid>,
    /// Reservation token (live or spent) → waitlist entry id.
    tokens: DashMap<String, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            courts: DashMap::new(),
            entity_to_court: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    // ── Courts ───────────────────────────────────────────────

    pub fn court_count(&self) -> usize {
        self.courts.len()
    }

    pub fn contains_court(&self, id: &Ulid) -> bool {
        self.courts.contains_key(id)
    }

    pub fn get_court(&self, id: &Ulid) -> Option<SharedCourtState> {
        self.courts.get(id).map(|e| e.value().clone())
    }

    pub fn insert_court(&self, id: Ulid, state: SharedCourtState) {
        self.courts.insert(id, state);
    }

    pub fn remove_court(&self, id: &Ulid) -> Option<(Ulid, SharedCourtState)> {
        self.courts.remove(id)
    }

    pub fn court_ids(&self) -> Vec<Ulid> {
        self.courts.iter().map(|e| *e.key()).collect()
    }

    pub fn courts(&self) -> Vec<SharedCourtState> {
        self.courts.iter().map(|e| e.value().clone()).collect()
    }

    // ── Entity index ─────────────────────────────────────────

    pub fn court_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_court.get(entity_id).map(|e| *e.value())
    }

    pub fn map_entity(&self, entity_id: Ulid, court_id: Ulid) {
        self.entity_to_court.insert(entity_id, court_id);
    }

    pub fn unmap_entity(&self, entity_id: &Ulid) {
        self.entity_to_court.remove(entity_id);
    }

    // ── Token index ──────────────────────────────────────────

    pub fn entry_for_token(&self, token: &str) -> Option<Ulid> {
        self.tokens.get(token).map(|e| *e.value())
    }

    pub fn contains_token(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }

    pub fn map_token(&self, token: String, entry_id: Ulid) {
        self.tokens.insert(token, entry_id);
    }

    pub fn unmap_token(&self, token: &str) {
        self.tokens.remove(token);
    }
}
