//! Process-wide `uid → EngineChannel` registry (spec §3 ownership note,
//! §9 "encapsulate the globals in a single Engine value").

use std::collections::HashMap;

use uuid::Uuid;

use super::channel::EngineChannel;

#[derive(Default)]
pub struct EngineRegistry {
    channels: HashMap<Uuid, EngineChannel>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uid: Uuid, channel: EngineChannel) {
        self.channels.insert(uid, channel);
    }

    pub fn get(&self, uid: &Uuid) -> Option<&EngineChannel> {
        self.channels.get(uid)
    }

    pub fn get_mut(&mut self, uid: &Uuid) -> Option<&mut EngineChannel> {
        self.channels.get_mut(uid)
    }

    pub fn contains(&self, uid: &Uuid) -> bool {
        self.channels.contains_key(uid)
    }

    pub fn remove(&mut self, uid: &Uuid) -> Option<EngineChannel> {
        self.channels.remove(uid)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Uuid, &mut EngineChannel)> {
        self.channels.iter_mut()
    }

    pub fn uids(&self) -> Vec<Uuid> {
        self.channels.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
