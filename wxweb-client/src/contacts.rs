//! Contact bookkeeping.
//!
//! Convenience over the contact-list endpoints, not protocol logic: the
//! directory just keeps the latest profile per `UserName`, bucketed the way
//! the service distinguishes accounts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

const PUBLIC_PLATFORM_FLAG: i64 = 8;

/// One contact profile as the service describes it.
///
/// Only the fields the client reads are typed; everything else rides along
/// in `extra` so a profile survives a round-trip unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "UserName")]
    pub user_name: String,
    #[serde(rename = "NickName", default)]
    pub nick_name: String,
    #[serde(rename = "RemarkName", default)]
    pub remark_name: String,
    #[serde(rename = "Sex", default)]
    pub sex: i64,
    #[serde(rename = "Signature", default)]
    pub signature: String,
    #[serde(rename = "VerifyFlag", default)]
    pub verify_flag: i64,
    #[serde(rename = "HeadImgUrl", default)]
    pub head_img_url: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Contact {
    /// Group chats get synthetic `@@…` user names.
    pub fn is_group(&self) -> bool {
        self.user_name.starts_with("@@")
    }

    /// Official/public-platform accounts carry a verify-flag bit.
    pub fn is_public_platform(&self) -> bool {
        self.verify_flag & PUBLIC_PLATFORM_FLAG != 0
    }
}

/// Latest known profile per user name, split into the three account classes.
#[derive(Debug, Clone, Default)]
pub struct ContactDirectory {
    personal: HashMap<String, Contact>,
    public_platforms: HashMap<String, Contact>,
    groups: HashMap<String, Contact>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_mut(&mut self, contact: &Contact) -> &mut HashMap<String, Contact> {
        if contact.is_group() {
            &mut self.groups
        } else if contact.is_public_platform() {
            &mut self.public_platforms
        } else {
            &mut self.personal
        }
    }

    /// Insert or replace a profile. A profile whose class changed moves
    /// buckets.
    pub fn upsert(&mut self, contact: Contact) {
        let name = contact.user_name.clone();
        self.remove(&name);
        self.bucket_mut(&contact).insert(name, contact);
    }

    pub fn extend(&mut self, contacts: impl IntoIterator<Item = Contact>) {
        for contact in contacts {
            self.upsert(contact);
        }
    }

    pub fn remove(&mut self, user_name: &str) -> Option<Contact> {
        self.personal
            .remove(user_name)
            .or_else(|| self.public_platforms.remove(user_name))
            .or_else(|| self.groups.remove(user_name))
    }

    pub fn get(&self, user_name: &str) -> Option<&Contact> {
        self.personal
            .get(user_name)
            .or_else(|| self.public_platforms.get(user_name))
            .or_else(|| self.groups.get(user_name))
    }

    pub fn personal(&self) -> impl Iterator<Item = &Contact> {
        self.personal.values()
    }

    pub fn public_platforms(&self) -> impl Iterator<Item = &Contact> {
        self.public_platforms.values()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Contact> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.personal.len() + self.public_platforms.len() + self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
