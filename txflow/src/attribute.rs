use std::{borrow::Cow, fmt::Display, str::FromStr};

use crate::{Error, ErrorKind, TransactionDefinition};

/// Decides whether an error matching a pattern rolls the transaction back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RollbackRule {
    pattern: Cow<'static, str>,
    rollback: bool,
}

impl RollbackRule {
    /// Returns a rule rolling back on errors matching `pattern`.
    pub fn rollback_on(pattern: impl Into<Cow<'static, str>>) -> Self {
        Self {
            pattern: pattern.into(),
            rollback: true,
        }
    }

    /// Returns a rule committing despite errors matching `pattern`.
    pub fn no_rollback_on(pattern: impl Into<Cow<'static, str>>) -> Self {
        Self {
            pattern: pattern.into(),
            rollback: false,
        }
    }

    /// Returns the pattern matched against error descriptions.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Returns true if a match rolls the transaction back.
    #[must_use]
    pub const fn is_rollback(&self) -> bool {
        self.rollback
    }

    /// Returns how deep in the error chain the first match is found. The
    /// top-level error matches on its type name or its message; its sources
    /// match on their messages.
    fn depth(&self, type_name: &str, chain: &[String]) -> Option<usize> {
        chain.iter().enumerate().find_map(|(depth, message)| {
            let matched = message.contains(&*self.pattern)
                || (depth == 0 && type_name.contains(&*self.pattern));
            matched.then_some(depth)
        })
    }
}

impl Display for RollbackRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.rollback { '-' } else { '+' };
        write!(f, "{sign}{}", self.pattern)
    }
}

/// A [`TransactionDefinition`] plus the rules deciding which errors roll the
/// transaction back.
///
/// The text form is a comma separated list of tokens:
/// `PROPAGATION_REQUIRED,ISOLATION_READ_COMMITTED,timeout_10,readOnly,-Conflict,+NotFound`.
/// A token starting with `-` adds a rule rolling back on matching errors and
/// a token starting with `+` adds a rule committing despite them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[must_use]
pub struct TransactionAttribute {
    /// The transaction definition.
    pub definition: TransactionDefinition,
    /// An optional qualifier selecting the transaction manager to use.
    pub qualifier: Option<String>,
    /// The rollback rules, in priority order for equally specific matches.
    pub rollback_rules: Vec<RollbackRule>,
}

impl From<TransactionDefinition> for TransactionAttribute {
    fn from(definition: TransactionDefinition) -> Self {
        Self {
            definition,
            qualifier: None,
            rollback_rules: Vec::new(),
        }
    }
}

impl TransactionAttribute {
    /// Adds `rule` after the existing rules.
    pub fn with_rule(mut self, rule: RollbackRule) -> Self {
        self.rollback_rules.push(rule);
        self
    }

    /// Sets the qualifier.
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    /// Returns true if `error` should roll the transaction back.
    ///
    /// The rule matching closest to the top of the error's source chain
    /// wins, with ties going to the rule listed first. Errors no rule
    /// matches roll back.
    pub fn rollback_on<E: std::error::Error + 'static>(&self, error: &E) -> bool {
        let type_name = std::any::type_name::<E>();
        let mut chain = vec![error.to_string()];
        let mut source = error.source();
        while let Some(link) = source {
            chain.push(link.to_string());
            source = link.source();
        }

        let winner = self
            .rollback_rules
            .iter()
            .filter_map(|rule| rule.depth(type_name, &chain).map(|depth| (depth, rule)))
            .min_by_key(|(depth, _)| *depth);
        match winner {
            Some((depth, rule)) => {
                tracing::trace!(%rule, depth, "rollback rule matched");
                rule.rollback
            }
            None => true,
        }
    }
}

impl Display for TransactionAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.definition, f)?;
        for rule in &self.rollback_rules {
            write!(f, ",{rule}")?;
        }
        Ok(())
    }
}

impl FromStr for TransactionAttribute {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut attribute = Self::default();
        for token in s.split(',').map(str::trim).filter(|token| !token.is_empty()) {
            if token.starts_with("PROPAGATION_") {
                attribute.definition.propagation = token.parse()?;
            } else if token.starts_with("ISOLATION_") {
                attribute.definition.isolation = token.parse()?;
            } else if let Some(seconds) = token.strip_prefix("timeout_") {
                attribute.definition.timeout = seconds.parse().map_err(|_| {
                    Error::from(ErrorKind::InvalidAttribute(format!(
                        "invalid timeout {seconds}"
                    )))
                })?;
            } else if token == "readOnly" {
                attribute.definition.read_only = true;
            } else if let Some(pattern) = token.strip_prefix('-') {
                attribute
                    .rollback_rules
                    .push(RollbackRule::rollback_on(pattern.to_string()));
            } else if let Some(pattern) = token.strip_prefix('+') {
                attribute
                    .rollback_rules
                    .push(RollbackRule::no_rollback_on(pattern.to_string()));
            } else {
                return Err(Error::from(ErrorKind::InvalidAttribute(format!(
                    "unrecognized token {token}"
                ))));
            }
        }
        attribute.definition.validate_timeout()?;
        Ok(attribute)
    }
}
