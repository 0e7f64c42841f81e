//! Process Instances
//!
//! One execution of a process definition: its token tree, its variables and
//! its lifecycle timestamps. Sub-process instances created while the
//! instance runs are kept in a cascade list until the next save, and so are
//! deferred messaging and scheduler calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;

use super::token::{Token, TokenId, TokenTree, ROOT_TOKEN};
use crate::error::EngineError;
use crate::graph::{NodeId, ProcessDefinition};
use crate::services::DeferredOperation;
use crate::variables::{SetOutcome, TypeRegistry, VariableError, VariableInstance, VariableScope, VariableValue};

pub type InstanceId = u64;

/// The token of a super-process waiting on a sub-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuperProcessToken {
    pub instance: InstanceId,
    pub token: TokenId,
}

#[derive(Debug, Clone)]
pub struct ProcessInstance {
    id: InstanceId,
    version: u64,
    key: Option<String>,
    definition: Arc<ProcessDefinition>,
    tokens: TokenTree,
    variables: VariableScope,
    start: NaiveDateTime,
    end: Option<NaiveDateTime>,
    suspended: bool,
    super_process_token: Option<SuperProcessToken>,
    super_notified: bool,
    cascade: Vec<ProcessInstance>,
    /// Present while the instance defers jobs
    deferred: Option<Vec<DeferredOperation>>,
}

/// Serializable view of an instance.
#[derive(Debug, Serialize)]
pub struct InstanceSnapshot<'a> {
    pub id: InstanceId,
    pub version: u64,
    pub key: Option<&'a str>,
    pub definition: &'a str,
    pub definition_version: u32,
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
    pub suspended: bool,
    pub super_process_token: Option<SuperProcessToken>,
    pub tokens: &'a TokenTree,
    pub variables: &'a VariableScope,
}

impl ProcessInstance {
    /// Creates an instance whose root token sits on `start_node`.
    pub fn new(id: InstanceId, definition: Arc<ProcessDefinition>, start_node: NodeId, now: NaiveDateTime) -> Self {
        Self {
            id,
            version: 0,
            key: None,
            definition,
            tokens: TokenTree::with_root(start_node, now),
            variables: VariableScope::new(),
            start: now,
            end: None,
            suspended: false,
            super_process_token: None,
            super_notified: false,
            cascade: Vec::new(),
            deferred: None,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Persistence version; 0 until first saved.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn set_key(&mut self, key: impl Into<String>) {
        self.key = Some(key.into());
    }

    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    pub fn definition_arc(&self) -> Arc<ProcessDefinition> {
        Arc::clone(&self.definition)
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> Option<NaiveDateTime> {
        self.end
    }

    pub(crate) fn set_end(&mut self, end: NaiveDateTime) {
        self.end = Some(end);
    }

    pub fn has_ended(&self) -> bool {
        self.end.is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub(crate) fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
        for token in self.tokens.iter_mut() {
            token.suspended = suspended;
        }
    }

    pub fn super_process_token(&self) -> Option<SuperProcessToken> {
        self.super_process_token
    }

    pub(crate) fn set_super_process_token(&mut self, token: SuperProcessToken) {
        self.super_process_token = Some(token);
    }

    /// Whether the super-process already received this instance's end.
    pub fn super_notified(&self) -> bool {
        self.super_notified
    }

    pub(crate) fn set_super_notified(&mut self) {
        self.super_notified = true;
    }

    pub(crate) fn push_cascade(&mut self, instance: ProcessInstance) {
        self.cascade.push(instance);
    }

    pub(crate) fn cascade_mut(&mut self) -> &mut Vec<ProcessInstance> {
        &mut self.cascade
    }

    pub(crate) fn take_cascade(&mut self) -> Vec<ProcessInstance> {
        std::mem::take(&mut self.cascade)
    }

    /// Holds back job sends and timer changes until the next save, which
    /// applies them once the instance is stored. Dropping the instance
    /// unsaved discards them.
    pub fn defer_jobs(&mut self) {
        self.deferred.get_or_insert_with(Vec::new);
    }

    pub fn defers_jobs(&self) -> bool {
        self.deferred.is_some()
    }

    /// Operations awaiting the next save.
    pub fn deferred(&self) -> &[DeferredOperation] {
        self.deferred.as_deref().unwrap_or(&[])
    }

    pub(crate) fn deferred_mut(&mut self) -> Option<&mut Vec<DeferredOperation>> {
        self.deferred.as_mut()
    }

    pub(crate) fn take_deferred(&mut self) -> Option<Vec<DeferredOperation>> {
        self.deferred.take()
    }

    pub(crate) fn restore_deferred(&mut self, deferred: Option<Vec<DeferredOperation>>) {
        self.deferred = deferred;
    }

    /// Sub-process instances awaiting the next save.
    pub fn cascade(&self) -> &[ProcessInstance] {
        &self.cascade
    }

    pub fn root_token(&self) -> &Token {
        self.tokens.root()
    }

    pub fn token(&self, id: TokenId) -> Result<&Token, EngineError> {
        self.tokens.get(id).ok_or(EngineError::UnknownToken(id))
    }

    pub fn token_mut(&mut self, id: TokenId) -> Result<&mut Token, EngineError> {
        self.tokens.get_mut(id).ok_or(EngineError::UnknownToken(id))
    }

    pub fn tokens(&self) -> &TokenTree {
        &self.tokens
    }

    pub(crate) fn tokens_mut(&mut self) -> &mut TokenTree {
        &mut self.tokens
    }

    /// Token by full name, e.g. `/left`.
    pub fn find_token(&self, path: &str) -> Option<TokenId> {
        self.tokens.find_by_path(path)
    }

    pub fn token_name(&self, id: TokenId) -> String {
        self.tokens.full_name(id)
    }

    pub fn lock_token(&mut self, id: TokenId, owner: &str, now: NaiveDateTime) -> Result<(), EngineError> {
        let name = self.token_name(id);
        self.token_mut(id)?
            .lock(owner, now)
            .map_err(|current| EngineError::LockConflict {
                token: name,
                owner: current,
                requested: owner.to_string(),
            })
    }

    pub fn unlock_token(&mut self, id: TokenId, owner: &str) -> Result<(), EngineError> {
        let name = self.token_name(id);
        self.token_mut(id)?
            .unlock(owner)
            .map_err(|current| EngineError::TokenLocked { token: name, owner: current })
    }

    pub fn force_unlock(&mut self, id: TokenId) -> Result<(), EngineError> {
        self.token_mut(id)?.force_unlock();
        Ok(())
    }

    /// Variable visible from `token`.
    pub fn variable(&self, token: TokenId, name: &str) -> Result<Option<VariableValue>, VariableError> {
        self.variables.get(&self.tokens, token, name)
    }

    pub fn has_variable(&self, token: TokenId, name: &str) -> bool {
        self.variables.has(&self.tokens, token, name)
    }

    /// Writes through the scope rules; returns the token that received the
    /// write.
    pub fn set_variable(
        &mut self,
        token: TokenId,
        name: &str,
        value: VariableValue,
        registry: &TypeRegistry,
    ) -> Result<(TokenId, SetOutcome), VariableError> {
        self.variables.set(&self.tokens, token, name, value, registry)
    }

    pub fn delete_variable(&mut self, token: TokenId, name: &str) -> Option<TokenId> {
        self.variables.delete(&self.tokens, token, name)
    }

    pub fn variables(&self, token: TokenId) -> Result<BTreeMap<String, VariableValue>, VariableError> {
        self.variables.variables(&self.tokens, token)
    }

    pub fn variable_scope(&self) -> &VariableScope {
        &self.variables
    }

    pub fn unpersistable_variables(&self) -> Vec<&VariableInstance> {
        self.variables.unpersistable().collect()
    }

    /// Fails with the first variable that can't be persisted.
    pub fn check_persistable(&self) -> Result<(), VariableError> {
        self.variables.check_persistable()
    }

    pub fn snapshot(&self) -> InstanceSnapshot<'_> {
        InstanceSnapshot {
            id: self.id,
            version: self.version,
            key: self.key.as_deref(),
            definition: self.definition.name(),
            definition_version: self.definition.version(),
            start: self.start,
            end: self.end,
            suspended: self.suspended,
            super_process_token: self.super_process_token,
            tokens: &self.tokens,
            variables: &self.variables,
        }
    }
}

impl ProcessInstance {
    /// Id of the root token.
    pub fn root_token_id(&self) -> TokenId {
        ROOT_TOKEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;
    use crate::variables::OpaqueValue;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap().and_hms_opt(10, 0, 0).unwrap()
    }

    fn instance() -> ProcessInstance {
        let mut definition = ProcessDefinition::new("p");
        let start = definition.add_node("start", NodeKind::Start).unwrap();
        ProcessInstance::new(1, Arc::new(definition), start, now())
    }

    #[test]
    fn test_lock_errors_name_tokens() {
        let mut instance = instance();
        instance.lock_token(ROOT_TOKEN, "X", now()).unwrap();

        match instance.lock_token(ROOT_TOKEN, "Y", now()) {
            Err(EngineError::LockConflict { token, owner, requested }) => {
                assert_eq!(token, "/");
                assert_eq!(owner, "X");
                assert_eq!(requested, "Y");
            }
            other => panic!("expected lock conflict, got {:?}", other),
        }
        assert!(matches!(
            instance.unlock_token(ROOT_TOKEN, "Y"),
            Err(EngineError::TokenLocked { .. })
        ));
        instance.force_unlock(ROOT_TOKEN).unwrap();
        assert!(!instance.root_token().is_locked());
        assert!(matches!(instance.token(9), Err(EngineError::UnknownToken(9))));
    }

    #[test]
    fn test_snapshot_serializes() {
        let registry = TypeRegistry::default();
        let mut instance = instance();
        instance
            .set_variable(ROOT_TOKEN, "amount", 12.into(), &registry)
            .unwrap();

        let json = serde_json::to_string(&instance.snapshot()).unwrap();
        assert!(json.contains("\"amount\""));
        assert!(json.contains("\"definition\":\"p\""));
    }

    #[test]
    fn test_snapshot_rejects_unpersistable() {
        let registry = TypeRegistry::default();
        let mut instance = instance();
        instance
            .set_variable(ROOT_TOKEN, "handle", OpaqueValue::new(5u8).into(), &registry)
            .unwrap();

        assert_eq!(instance.unpersistable_variables().len(), 1);
        assert!(instance.check_persistable().is_err());
        assert!(serde_json::to_string(&instance.snapshot()).is_err());
    }
}
