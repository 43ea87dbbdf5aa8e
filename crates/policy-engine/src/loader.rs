use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::evaluator::{BusKind, Policy};
use crate::matcher::{DirectionPattern, InterfacePattern, MethodPattern, PathPattern, PatternError};
use crate::rule::Rule;
use crate::schema::{ConfigDocument, MethodField, RuleRecord};

/// Why a configuration payload could not be turned into a [`Policy`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("configuration is not a valid document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("configuration contains neither '{}' nor '{}'", BusKind::Session.config_key(), BusKind::System.config_key())]
    NoRuleLists,

    #[error("rule {index} in '{list}' has an invalid '{field}': {source}")]
    InvalidRule {
        list: &'static str,
        index: usize,
        field: &'static str,
        #[source]
        source: PatternError,
    },

    #[error("failed to read configuration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parse a configuration payload into a complete [`Policy`].
///
/// Either the whole document is accepted or an error is returned; there is
/// no partially built result.
pub fn parse(payload: &[u8]) -> Result<Policy, ParseError> {
    let doc: ConfigDocument = serde_json::from_slice(payload)?;
    compile(doc)
}

pub fn parse_str(payload: &str) -> Result<Policy, ParseError> {
    parse(payload.as_bytes())
}

/// Read and parse a configuration file.
pub fn load_policy(path: impl AsRef<Path>) -> Result<Policy, ParseError> {
    let path = path.as_ref();
    let contents = std::fs::read(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&contents)
}

fn compile(doc: ConfigDocument) -> Result<Policy, ParseError> {
    if doc.session.is_none() && doc.system.is_none() {
        return Err(ParseError::NoRuleLists);
    }

    let session = compile_list(BusKind::Session, doc.session.unwrap_or_default())?;
    let system = compile_list(BusKind::System, doc.system.unwrap_or_default())?;

    debug!(
        session_rules = session.len(),
        system_rules = system.len(),
        "configuration compiled"
    );

    Ok(Policy::new(session, system))
}

fn compile_list(bus: BusKind, records: Vec<RuleRecord>) -> Result<Vec<Rule>, ParseError> {
    let list = bus.config_key();
    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| compile_rule(list, index, record))
        .collect()
}

fn compile_rule(list: &'static str, index: usize, record: RuleRecord) -> Result<Rule, ParseError> {
    let invalid = |field: &'static str| {
        move |source: PatternError| ParseError::InvalidRule {
            list,
            index,
            field,
            source,
        }
    };

    let direction: DirectionPattern = record
        .direction
        .as_deref()
        .unwrap_or("*")
        .parse()
        .map_err(invalid("direction"))?;
    let interface: InterfacePattern = record
        .interface
        .as_deref()
        .unwrap_or("*")
        .parse()
        .map_err(invalid("interface"))?;
    let object_path: PathPattern = record
        .object_path
        .as_deref()
        .unwrap_or("*")
        .parse()
        .map_err(invalid("object-path"))?;
    let method = match record.method {
        None => MethodPattern::Any,
        Some(MethodField::One(name)) => name.parse().map_err(invalid("method"))?,
        Some(MethodField::Many(names)) => {
            if names.is_empty() {
                warn!(list, index, "rule has an empty method list and can never match");
            }
            MethodPattern::from_names(&names).map_err(invalid("method"))?
        }
    };

    Ok(Rule::new(direction, interface, object_path, method))
}
