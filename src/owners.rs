use std::collections::HashMap;

use nix::unistd::{Gid, Group, Uid, User};

/// Memoized passwd/group database lookups. Both directions are cached for the
/// whole run: id to name while writing a backup, name to id while restoring.
/// Missing entries are cached too.
#[derive(Default)]
pub struct OwnerCache {
    user_names: HashMap<u32, Option<String>>,
    group_names: HashMap<u32, Option<String>>,
    uids: HashMap<String, Option<u32>>,
    gids: HashMap<String, Option<u32>>,
}

impl OwnerCache {
    pub fn user_name(&mut self, uid: u32) -> Option<String> {
        self.user_names
            .entry(uid)
            .or_insert_with(|| {
                User::from_uid(Uid::from_raw(uid))
                    .ok()
                    .flatten()
                    .map(|user| user.name)
            })
            .clone()
    }

    pub fn group_name(&mut self, gid: u32) -> Option<String> {
        self.group_names
            .entry(gid)
            .or_insert_with(|| {
                Group::from_gid(Gid::from_raw(gid))
                    .ok()
                    .flatten()
                    .map(|group| group.name)
            })
            .clone()
    }

    pub fn uid(&mut self, name: &str) -> Option<u32> {
        if let Some(uid) = self.uids.get(name) {
            return *uid;
        }

        let uid = User::from_name(name)
            .ok()
            .flatten()
            .map(|user| user.uid.as_raw());
        self.uids.insert(name.to_owned(), uid);
        uid
    }

    pub fn gid(&mut self, name: &str) -> Option<u32> {
        if let Some(gid) = self.gids.get(name) {
            return *gid;
        }

        let gid = Group::from_name(name)
            .ok()
            .flatten()
            .map(|group| group.gid.as_raw());
        self.gids.insert(name.to_owned(), gid);
        gid
    }
}
