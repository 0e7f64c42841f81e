//! Variable Containers and Scopes
//!
//! Every token owns at most one [`VariableContainer`]. A [`VariableScope`]
//! holds the containers of all tokens of a process instance and implements
//! the hierarchical rules:
//! - Reads resolve locally first, then up the token's ancestors
//! - Writes land where the name is already defined (locally or on the
//!   nearest ancestor); new names are created on the writing token

use std::collections::BTreeMap;

use serde::Serialize;

use super::instance::VariableInstance;
use super::types::TypeRegistry;
use super::value::VariableValue;
use super::VariableError;
use crate::execution::TokenId;

/// Guards ancestor walks against malformed parent links.
const MAX_DEPTH: usize = 1024;

/// Parent lookup over a token tree.
pub trait TokenLineage {
    fn parent_of(&self, token: TokenId) -> Option<TokenId>;
}

/// `token` followed by its ancestors, nearest first.
fn ancestry<L: TokenLineage + ?Sized>(lineage: &L, token: TokenId) -> Vec<TokenId> {
    std::iter::successors(Some(token), |current| lineage.parent_of(*current))
        .take(MAX_DEPTH)
        .collect()
}

/// What a write did to the container it landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Created,
    Updated,
    /// The old instance couldn't hold the new value and was replaced
    Replaced,
}

/// The variables local to one token.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VariableContainer {
    instances: BTreeMap<String, VariableInstance>,
}

impl VariableContainer {
    pub fn has(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<Option<VariableValue>, VariableError> {
        self.instances
            .get(name)
            .map(VariableInstance::value)
            .transpose()
    }

    pub fn instance(&self, name: &str) -> Option<&VariableInstance> {
        self.instances.get(name)
    }

    pub fn set(
        &mut self,
        token: TokenId,
        name: &str,
        value: VariableValue,
        registry: &TypeRegistry,
    ) -> Result<SetOutcome, VariableError> {
        if let Some(existing) = self.instances.get_mut(name) {
            if existing.supports(&value) {
                existing.set_value(value)?;
                return Ok(SetOutcome::Updated);
            }
            let replacement = VariableInstance::create(token, name, value, registry)?;
            self.instances.insert(name.to_string(), replacement);
            return Ok(SetOutcome::Replaced);
        }

        let instance = VariableInstance::create(token, name, value, registry)?;
        self.instances.insert(name.to_string(), instance);
        Ok(SetOutcome::Created)
    }

    pub fn delete(&mut self, name: &str) -> Option<VariableInstance> {
        self.instances.remove(name)
    }

    pub fn instances(&self) -> impl Iterator<Item = &VariableInstance> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// All variable containers of one process instance, keyed by token.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VariableScope {
    containers: BTreeMap<TokenId, VariableContainer>,
}

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container(&self, token: TokenId) -> Option<&VariableContainer> {
        self.containers.get(&token)
    }

    pub fn has_local(&self, token: TokenId, name: &str) -> bool {
        self.containers
            .get(&token)
            .map_or(false, |container| container.has(name))
    }

    /// Nearest token in the lineage of `token` that defines `name`.
    pub fn defining_token<L: TokenLineage + ?Sized>(
        &self,
        lineage: &L,
        token: TokenId,
        name: &str,
    ) -> Option<TokenId> {
        ancestry(lineage, token)
            .into_iter()
            .find(|candidate| self.has_local(*candidate, name))
    }

    pub fn has<L: TokenLineage + ?Sized>(&self, lineage: &L, token: TokenId, name: &str) -> bool {
        self.defining_token(lineage, token, name).is_some()
    }

    /// Resolves `name` locally, then up the ancestors.
    pub fn get<L: TokenLineage + ?Sized>(
        &self,
        lineage: &L,
        token: TokenId,
        name: &str,
    ) -> Result<Option<VariableValue>, VariableError> {
        match self.defining_token(lineage, token, name) {
            Some(owner) => self.get_local(owner, name),
            None => Ok(None),
        }
    }

    pub fn get_local(&self, token: TokenId, name: &str) -> Result<Option<VariableValue>, VariableError> {
        match self.containers.get(&token) {
            Some(container) => container.get(name),
            None => Ok(None),
        }
    }

    /// Writes `name` where it is already defined, or on `token` when it is
    /// defined nowhere in the lineage. Returns the token whose container
    /// received the write.
    pub fn set<L: TokenLineage + ?Sized>(
        &mut self,
        lineage: &L,
        token: TokenId,
        name: &str,
        value: VariableValue,
        registry: &TypeRegistry,
    ) -> Result<(TokenId, SetOutcome), VariableError> {
        let owner = self.defining_token(lineage, token, name).unwrap_or(token);
        let outcome = self.set_local(owner, name, value, registry)?;
        Ok((owner, outcome))
    }

    pub fn set_local(
        &mut self,
        token: TokenId,
        name: &str,
        value: VariableValue,
        registry: &TypeRegistry,
    ) -> Result<SetOutcome, VariableError> {
        self.containers
            .entry(token)
            .or_default()
            .set(token, name, value, registry)
    }

    /// Deletes the nearest visible definition of `name`.
    pub fn delete<L: TokenLineage + ?Sized>(
        &mut self,
        lineage: &L,
        token: TokenId,
        name: &str,
    ) -> Option<TokenId> {
        let owner = self.defining_token(lineage, token, name)?;
        self.containers.get_mut(&owner)?.delete(name)?;
        Some(owner)
    }

    /// Every variable visible from `token`; nearer definitions win.
    pub fn variables<L: TokenLineage + ?Sized>(
        &self,
        lineage: &L,
        token: TokenId,
    ) -> Result<BTreeMap<String, VariableValue>, VariableError> {
        let mut visible = BTreeMap::new();
        for owner in ancestry(lineage, token).into_iter().rev() {
            visible.extend(self.variables_local(owner)?);
        }
        Ok(visible)
    }

    pub fn variables_local(&self, token: TokenId) -> Result<BTreeMap<String, VariableValue>, VariableError> {
        let mut local = BTreeMap::new();
        if let Some(container) = self.containers.get(&token) {
            for instance in container.instances() {
                local.insert(instance.name().to_string(), instance.value()?);
            }
        }
        Ok(local)
    }

    /// Instances that have no persistable form.
    pub fn unpersistable(&self) -> impl Iterator<Item = &VariableInstance> {
        self.containers
            .values()
            .flat_map(|container| container.instances())
            .filter(|instance| !instance.is_persistable())
    }

    /// Fails with the first unpersistable variable, if any.
    pub fn check_persistable(&self) -> Result<(), VariableError> {
        match self.unpersistable().next() {
            Some(instance) => Err(VariableError::Unpersistable {
                name: instance.name().to_string(),
                value_type: instance
                    .value()
                    .map(|value| value.type_name().to_string())
                    .unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }
}
