/// Named Procedures Module
///
/// SQLite has no stored procedures, so the bot's procedures live in a
/// [`ProcedureCatalog`]: each one is a statement body with `:name`
/// placeholders for its IN parameters, and its OUT parameters are read from
/// the identically named columns of the first result row.

use crate::core::db::builder::Statement;
use crate::core::db::driver::RowSet;
use crate::core::db::query::Database;
use crate::core::{DalError, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rusqlite::types::Value;
use std::collections::HashMap;
use tracing::{debug, error};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

static NAMED_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").expect("parameter pattern is valid"));

pub const GET_LOCAL_OPTION: &str = "GET_LOCAL_OPTION";
pub const GET_MESSAGE_CONTENT: &str = "GET_MESSAGE_CONTENT";
pub const GET_IW_URL: &str = "GET_IW_URL";

/// Longest interwiki prefix the store accepts
pub const MAX_IW_PREFIX_CHARS: usize = 32;

/// Channel override first, global value otherwise.
const GET_LOCAL_OPTION_BODY: &str = "\
SELECT COALESCE(
    (SELECT cc.cc_value FROM channelconfig cc
        INNER JOIN channel c ON c.channel_id = cc.cc_channel
        INNER JOIN configuration cf ON cf.configuration_id = cc.cc_config
        WHERE c.channel_name = :channel AND cf.configuration_name = :optionName
        LIMIT 1),
    (SELECT configuration_value FROM configuration
        WHERE configuration_name = :optionName
        LIMIT 1)
) AS optionValue";

const GET_MESSAGE_CONTENT_BODY: &str = "\
SELECT CAST(message_text AS BLOB) AS message FROM message
    WHERE message_name = :title
    ORDER BY message_id
    LIMIT 1";

const GET_IW_URL_BODY: &str = "\
SELECT iw_url AS url FROM interwikis WHERE iw_prefix = :prefix LIMIT 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDirection {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureParam {
    pub name: String,
    pub direction: ParamDirection,
}

/// A registered procedure with its compiled statement template
#[derive(Debug, Clone)]
pub struct Procedure {
    name: String,
    params: Vec<ProcedureParam>,
    template: String,
    /// IN parameter names in placeholder order
    bind_order: Vec<String>,
}

impl Procedure {
    fn param(&self, name: &str) -> Option<&ProcedureParam> {
        self.params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    fn inputs(&self) -> impl Iterator<Item = &ProcedureParam> {
        self.params.iter().filter(|p| p.direction == ParamDirection::In)
    }

    fn outputs(&self) -> impl Iterator<Item = &ProcedureParam> {
        self.params.iter().filter(|p| p.direction == ParamDirection::Out)
    }

    /// Maps the first row onto the OUT parameters. No row leaves them NULL.
    fn collect_outputs(&self, rows: &RowSet) -> Result<ProcedureOutput> {
        let mut values = Vec::new();
        for param in self.outputs() {
            let value = match rows.rows.first() {
                None => Value::Null,
                Some(row) => {
                    let index = rows.column_index(&param.name).ok_or_else(|| {
                        DalError::Parameter(format!(
                            "procedure {} produced no output parameter '{}'",
                            self.name, param.name
                        ))
                    })?;
                    row.get(index).cloned().unwrap_or(Value::Null)
                }
            };
            values.push((param.name.clone(), value));
        }
        Ok(ProcedureOutput { values })
    }
}

/// OUT parameter values of one call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcedureOutput {
    values: Vec<(String, Value)>,
}

impl ProcedureOutput {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Text of an OUT parameter; NULL and absent are `None`
    pub fn text(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Real(f) => Some(f.to_string()),
            Value::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
        }
    }

    /// Binary payload of an OUT parameter; NULL and absent are empty
    pub fn bytes(&self, name: &str) -> Vec<u8> {
        match self.get(name) {
            Some(Value::Blob(b)) => b.clone(),
            Some(Value::Text(s)) => s.as_bytes().to_vec(),
            Some(Value::Integer(i)) => i.to_string().into_bytes(),
            Some(Value::Real(f)) => f.to_string().into_bytes(),
            Some(Value::Null) | None => Vec::new(),
        }
    }
}

/// Registry of named procedures. Names are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct ProcedureCatalog {
    procedures: HashMap<String, Procedure>,
}

impl ProcedureCatalog {
    /// An empty catalog
    pub fn new() -> Self {
        ProcedureCatalog::default()
    }

    /// A catalog holding the bot's procedures
    pub fn with_defaults() -> Result<Self> {
        use ParamDirection::{In, Out};

        let mut catalog = ProcedureCatalog::new();
        catalog.register(
            GET_LOCAL_OPTION,
            &[("optionName", In), ("channel", In), ("optionValue", Out)],
            GET_LOCAL_OPTION_BODY,
        )?;
        catalog.register(
            GET_MESSAGE_CONTENT,
            &[("title", In), ("message", Out)],
            GET_MESSAGE_CONTENT_BODY,
        )?;
        catalog.register(GET_IW_URL, &[("prefix", In), ("url", Out)], GET_IW_URL_BODY)?;
        Ok(catalog)
    }

    /// Registers or replaces a procedure.
    ///
    /// Every `:name` placeholder in `body` must be a declared IN parameter.
    /// Placeholders are recognized anywhere in the body, string literals
    /// included.
    pub fn register(
        &mut self,
        name: &str,
        params: &[(&str, ParamDirection)],
        body: &str,
    ) -> Result<()> {
        if !IDENTIFIER.is_match(name) {
            return Err(DalError::Parameter(format!("invalid procedure name '{}'", name)));
        }

        let mut declared: Vec<ProcedureParam> = Vec::with_capacity(params.len());
        for (param, direction) in params {
            if !IDENTIFIER.is_match(param) {
                return Err(DalError::Parameter(format!(
                    "invalid parameter name '{}' in {}",
                    param, name
                )));
            }
            if declared.iter().any(|p| p.name.eq_ignore_ascii_case(param)) {
                return Err(DalError::Parameter(format!(
                    "duplicate parameter '{}' in {}",
                    param, name
                )));
            }
            declared.push(ProcedureParam {
                name: param.to_string(),
                direction: *direction,
            });
        }

        let mut bind_order: Vec<String> = Vec::new();
        let mut unknown: Option<String> = None;
        let template = NAMED_PARAM.replace_all(body, |caps: &Captures| {
            let placeholder = &caps[1];
            let input = declared
                .iter()
                .find(|p| p.direction == ParamDirection::In && p.name.eq_ignore_ascii_case(placeholder));
            match input {
                Some(param) => {
                    let position = match bind_order.iter().position(|n| n == &param.name) {
                        Some(position) => position,
                        None => {
                            bind_order.push(param.name.clone());
                            bind_order.len() - 1
                        }
                    };
                    format!("?{}", position + 1)
                }
                None => {
                    if unknown.is_none() {
                        unknown = Some(placeholder.to_string());
                    }
                    caps[0].to_string()
                }
            }
        });
        if let Some(placeholder) = unknown {
            return Err(DalError::Parameter(format!(
                "procedure {} uses undeclared input ':{}'",
                name, placeholder
            )));
        }

        let procedure = Procedure {
            name: name.to_string(),
            params: declared,
            template: template.into_owned(),
            bind_order,
        };
        debug!(procedure = name, "Registered procedure");
        self.procedures.insert(name.to_ascii_uppercase(), procedure);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Procedure> {
        self.procedures.get(&name.to_ascii_uppercase())
    }

    /// Validates the arguments of a call and binds them.
    ///
    /// Every IN parameter must be supplied exactly once and nothing else.
    pub fn bind(&self, name: &str, args: &[(&str, Value)]) -> Result<(&Procedure, Statement)> {
        let procedure = self
            .get(name)
            .ok_or_else(|| DalError::Parameter(format!("unknown procedure {}", name)))?;

        let mut supplied: HashMap<&str, &Value> = HashMap::new();
        for (arg, value) in args {
            let param = procedure
                .param(arg)
                .filter(|p| p.direction == ParamDirection::In)
                .ok_or_else(|| {
                    DalError::Parameter(format!("{} has no input parameter '{}'", name, arg))
                })?;
            if supplied.insert(param.name.as_str(), value).is_some() {
                return Err(DalError::Parameter(format!(
                    "input parameter '{}' of {} supplied twice",
                    param.name, name
                )));
            }
        }
        if let Some(missing) = procedure.inputs().find(|p| !supplied.contains_key(p.name.as_str())) {
            return Err(DalError::Parameter(format!(
                "missing input parameter '{}' for {}",
                missing.name, name
            )));
        }

        let params = procedure
            .bind_order
            .iter()
            .filter_map(|n| supplied.get(n.as_str()).map(|v| (*v).clone()))
            .collect();
        Ok((procedure, Statement::with_params(procedure.template.clone(), params)))
    }
}

impl Database {
    /// Calls a named procedure.
    ///
    /// Parameter and format errors are logged and returned, as are
    /// statement failures; nothing here soft-fails.
    pub fn execute_procedure(&self, name: &str, args: &[(&str, Value)]) -> Result<ProcedureOutput> {
        let (procedure, stmt) = self.procedures().bind(name, args).map_err(|e| {
            error!(procedure = name, error = %e, "Invalid procedure call");
            e
        })?;
        debug!(procedure = name, sql = %stmt.render(), "Calling procedure");

        let rows = self.with_connection(|conn| conn.query(&stmt))?;
        procedure.collect_outputs(&rows).map_err(|e| {
            error!(procedure = name, error = %e, "Procedure output mismatch");
            e
        })
    }

    /// Calls a procedure, mapping plain statement failures to `None`.
    /// Parameter errors, lock errors and connectivity exhaustion propagate.
    fn call_procedure(&self, name: &str, args: &[(&str, Value)]) -> Result<Option<ProcedureOutput>> {
        match self.execute_procedure(name, args) {
            Ok(output) => Ok(Some(output)),
            Err(e)
                if matches!(
                    e,
                    DalError::Parameter(_)
                        | DalError::Lock(_)
                        | DalError::ConnectivityExhausted { .. }
                ) =>
            {
                Err(e)
            }
            Err(e) => {
                error!(procedure = name, error = %e, "Procedure call failed");
                Ok(None)
            }
        }
    }

    /// Per-channel option value, falling back to the global value.
    /// `None` when neither exists.
    pub fn get_local_option(&self, option: &str, channel: &str) -> Result<Option<String>> {
        let output = self.call_procedure(
            GET_LOCAL_OPTION,
            &[
                ("optionName", Value::Text(option.to_string())),
                ("channel", Value::Text(channel.to_string())),
            ],
        )?;
        Ok(output.and_then(|o| o.text("optionValue")))
    }

    /// Message body by title, decoded as UTF-8. Unknown titles are empty.
    pub fn get_message_content(&self, title: &str) -> Result<String> {
        let output = self.call_procedure(
            GET_MESSAGE_CONTENT,
            &[("title", Value::Text(title.to_string()))],
        )?;
        let payload = output.map(|o| o.bytes("message")).unwrap_or_default();
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    /// URL template of an interwiki prefix; empty when unknown.
    ///
    /// Prefixes longer than [`MAX_IW_PREFIX_CHARS`] are rejected here
    /// without touching the connection.
    pub fn get_iw_url(&self, prefix: &str) -> Result<String> {
        if prefix.chars().count() > MAX_IW_PREFIX_CHARS {
            debug!(prefix, "Interwiki prefix too long");
            return Ok(String::new());
        }
        let output = self.call_procedure(GET_IW_URL, &[("prefix", Value::Text(prefix.to_string()))])?;
        Ok(output.and_then(|o| o.text("url")).unwrap_or_default())
    }
}
