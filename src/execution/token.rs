//! Tokens
//!
//! Execution pointers of one process instance, stored in an arena indexed by
//! [`TokenId`]. The root token has id 0; forks add named children. Parent and
//! child links are ids, never references.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::graph::NodeId;
use crate::variables::TokenLineage;

/// Index of a token within its process instance.
pub type TokenId = usize;

pub const ROOT_TOKEN: TokenId = 0;

/// Advisory lock held on a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenLock {
    pub owner: String,
    pub time: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct Token {
    pub id: TokenId,
    /// `None` only for the root
    pub name: Option<String>,
    pub parent: Option<TokenId>,
    pub children: BTreeMap<String, TokenId>,
    pub node: NodeId,
    pub node_enter: NaiveDateTime,
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
    pub suspended: bool,
    pub lock: Option<TokenLock>,
    /// Cleared once this token's arrival has been counted by a join
    pub able_to_reactivate_parent: bool,
    /// Sub-process instance started from this token's process-state node
    pub sub_process_instance: Option<u64>,
    next_log_index: u64,
}

impl Token {
    fn new(id: TokenId, name: Option<String>, parent: Option<TokenId>, node: NodeId, now: NaiveDateTime) -> Self {
        Self {
            id,
            name,
            parent,
            children: BTreeMap::new(),
            node,
            node_enter: now,
            start: now,
            end: None,
            suspended: false,
            lock: None,
            able_to_reactivate_parent: true,
            sub_process_instance: None,
            next_log_index: 0,
        }
    }

    pub fn has_ended(&self) -> bool {
        self.end.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn lock_owner(&self) -> Option<&str> {
        self.lock.as_ref().map(|lock| lock.owner.as_str())
    }

    /// Takes the lock for `owner`; re-locking by the holder is a no-op.
    ///
    /// On conflict returns the current owner.
    pub fn lock(&mut self, owner: &str, now: NaiveDateTime) -> Result<(), String> {
        match &self.lock {
            Some(lock) if lock.owner != owner => Err(lock.owner.clone()),
            Some(_) => Ok(()),
            None => {
                self.lock = Some(TokenLock {
                    owner: owner.to_string(),
                    time: now,
                });
                Ok(())
            }
        }
    }

    /// Releases the lock if `owner` holds it.
    ///
    /// Unlocking an unlocked token succeeds; a foreign owner gets the
    /// current owner back.
    pub fn unlock(&mut self, owner: &str) -> Result<(), String> {
        match &self.lock {
            Some(lock) if lock.owner != owner => Err(lock.owner.clone()),
            _ => {
                self.lock = None;
                Ok(())
            }
        }
    }

    pub fn force_unlock(&mut self) {
        self.lock = None;
    }

    /// Sequence number for the next process log entry of this token.
    pub fn next_log_index(&mut self) -> u64 {
        let index = self.next_log_index;
        self.next_log_index += 1;
        index
    }
}

/// Arena of all tokens of one process instance.
#[derive(Debug, Clone, Serialize)]
pub struct TokenTree {
    tokens: Vec<Token>,
}

impl TokenTree {
    pub fn with_root(node: NodeId, now: NaiveDateTime) -> Self {
        Self {
            tokens: vec![Token::new(ROOT_TOKEN, None, None, node, now)],
        }
    }

    pub fn get(&self, id: TokenId) -> Option<&Token> {
        self.tokens.get(id)
    }

    pub fn get_mut(&mut self, id: TokenId) -> Option<&mut Token> {
        self.tokens.get_mut(id)
    }

    pub fn root(&self) -> &Token {
        &self.tokens[ROOT_TOKEN]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Token> {
        self.tokens.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Creates a child of `parent` positioned at `node`.
    ///
    /// Names stay unique among siblings: a taken `name` gets a numeric
    /// suffix, and unnamed children are called `token-<n>`.
    pub fn create_child(
        &mut self,
        parent: TokenId,
        name: Option<&str>,
        node: NodeId,
        now: NaiveDateTime,
    ) -> Option<TokenId> {
        let siblings = &self.tokens.get(parent)?.children;
        let base = name.map(str::to_string).unwrap_or_else(|| format!("token-{}", siblings.len() + 1));
        let mut unique = base.clone();
        let mut suffix = 2;
        while siblings.contains_key(&unique) {
            unique = format!("{}{}", base, suffix);
            suffix += 1;
        }

        let id = self.tokens.len();
        self.tokens
            .push(Token::new(id, Some(unique.clone()), Some(parent), node, now));
        self.tokens[parent].children.insert(unique, id);
        Some(id)
    }

    pub fn children_of(&self, parent: TokenId) -> Vec<TokenId> {
        self.tokens
            .get(parent)
            .map(|token| token.children.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn child(&self, parent: TokenId, name: &str) -> Option<TokenId> {
        self.tokens.get(parent)?.children.get(name).copied()
    }

    pub fn has_active_children(&self, parent: TokenId) -> bool {
        self.children_of(parent)
            .into_iter()
            .any(|child| !self.tokens[child].has_ended())
    }

    /// `/` for the root, `/a/b` for a grandchild.
    pub fn full_name(&self, id: TokenId) -> String {
        let mut names = Vec::new();
        let mut current = self.tokens.get(id);
        while let Some(token) = current {
            match (&token.name, token.parent) {
                (Some(name), Some(parent)) => {
                    names.push(name.as_str());
                    current = self.tokens.get(parent);
                }
                _ => break,
            }
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// Resolves a full name produced by [`TokenTree::full_name`].
    pub fn find_by_path(&self, path: &str) -> Option<TokenId> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(ROOT_TOKEN, |current, segment| self.child(current, segment))
    }

    /// Tokens that have not ended.
    pub fn active(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter().filter(|token| !token.has_ended())
    }
}

impl TokenLineage for TokenTree {
    fn parent_of(&self, token: TokenId) -> Option<TokenId> {
        self.tokens.get(token)?.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap().and_hms_opt(10, 0, 0).unwrap()
    }

    #[test]
    fn test_child_names_stay_unique() {
        let mut tree = TokenTree::with_root(0, now());
        let a = tree.create_child(ROOT_TOKEN, Some("left"), 1, now()).unwrap();
        let b = tree.create_child(ROOT_TOKEN, Some("left"), 1, now()).unwrap();
        let c = tree.create_child(ROOT_TOKEN, None, 1, now()).unwrap();

        assert_eq!(tree.get(a).unwrap().name.as_deref(), Some("left"));
        assert_eq!(tree.get(b).unwrap().name.as_deref(), Some("left2"));
        assert_eq!(tree.get(c).unwrap().name.as_deref(), Some("token-3"));
        assert_eq!(tree.children_of(ROOT_TOKEN).len(), 3);
    }

    #[test]
    fn test_full_name_and_lookup() {
        let mut tree = TokenTree::with_root(0, now());
        let a = tree.create_child(ROOT_TOKEN, Some("a"), 1, now()).unwrap();
        let b = tree.create_child(a, Some("b"), 2, now()).unwrap();

        assert_eq!(tree.full_name(ROOT_TOKEN), "/");
        assert_eq!(tree.full_name(b), "/a/b");
        assert_eq!(tree.find_by_path("/a/b"), Some(b));
        assert_eq!(tree.find_by_path("/"), Some(ROOT_TOKEN));
        assert_eq!(tree.find_by_path("/a/missing"), None);
        assert_eq!(tree.parent_of(b), Some(a));
    }

    #[test]
    fn test_active_children() {
        let mut tree = TokenTree::with_root(0, now());
        let a = tree.create_child(ROOT_TOKEN, Some("a"), 1, now()).unwrap();
        assert!(tree.has_active_children(ROOT_TOKEN));

        tree.get_mut(a).unwrap().end = Some(now());
        assert!(!tree.has_active_children(ROOT_TOKEN));
        assert_eq!(tree.active().count(), 1);
    }

    #[test]
    fn test_lock_ownership() {
        let mut tree = TokenTree::with_root(0, now());
        let token = tree.get_mut(ROOT_TOKEN).unwrap();

        token.lock("worker-1", now()).unwrap();
        assert!(token.lock("worker-1", now()).is_ok());
        assert_eq!(token.lock("worker-2", now()), Err("worker-1".to_string()));
        assert_eq!(token.unlock("worker-2"), Err("worker-1".to_string()));

        token.unlock("worker-1").unwrap();
        assert!(!token.is_locked());

        token.lock("worker-2", now()).unwrap();
        token.force_unlock();
        assert_eq!(token.lock_owner(), None);
    }

    #[test]
    fn test_log_index_is_monotonic() {
        let mut tree = TokenTree::with_root(0, now());
        let token = tree.get_mut(ROOT_TOKEN).unwrap();
        assert_eq!(token.next_log_index(), 0);
        assert_eq!(token.next_log_index(), 1);
    }
}
