//! Teams and their runnable programs.

use std::{hash::Hash, path::PathBuf, sync::Arc};

/// A runnable artifact: an executable plus the arguments always passed first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Program {
    /// Path (or name looked up in `PATH`) of the executable.
    pub path: PathBuf,
    /// Leading arguments, placed before the ones supplied by the executor.
    pub args: Vec<String>,
}

impl Program {
    /// A program run without leading arguments.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: vec![],
        }
    }

    /// Adds leading arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// A competing team. Immutable once a tournament run begins.
#[derive(Debug)]
pub struct Team {
    /// Unique name inside a tournament run.
    pub name: String,
    /// Produces instances of a requested size.
    pub generator: Program,
    /// Solves instances produced by the other teams.
    pub solver: Program,
}

impl PartialEq for Team {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Team {}

impl Hash for Team {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl std::fmt::Display for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Team {
    /// Creates a team shared by reference across every battle it takes part in.
    pub fn new(name: impl Into<String>, generator: Program, solver: Program) -> Arc<Team> {
        Arc::new(Team {
            name: name.into(),
            generator,
            solver,
        })
    }
}
