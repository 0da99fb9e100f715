//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Request/response field container."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use t_dcs_core::{CommError, Result};

use crate::xml;

/// One request field and the named response fields expected with it.
///
/// A message carries one or more of these; after the exchange each response
/// field holds the value scanned out of the reply document.
#[derive(Debug, Clone)]
pub struct ReqRes {
    req_name: String,
    req_val: String,
    res_names: Vec<String>,
    res_vals: Vec<String>,
}

impl ReqRes {
    /// A request field with no associated responses.
    pub fn new(req_name: impl Into<String>, req_val: impl Into<String>) -> Self {
        Self::with_responses(req_name, req_val, &[])
    }

    /// A request field expecting the named response fields.
    pub fn with_responses(
        req_name: impl Into<String>,
        req_val: impl Into<String>,
        res_names: &[&str],
    ) -> Self {
        Self {
            req_name: req_name.into(),
            req_val: req_val.into(),
            res_names: res_names.iter().map(|n| (*n).to_owned()).collect(),
            res_vals: vec![String::new(); res_names.len()],
        }
    }

    pub fn req_name(&self) -> &str {
        &self.req_name
    }

    pub fn req_val(&self) -> &str {
        &self.req_val
    }

    /// Fill in every expected response field from the reply document.
    pub fn parse_res(&mut self, msg_name: &str, token: &str) -> Result<()> {
        let body = xml::read_tag(token, msg_name).ok_or_else(|| {
            CommError::Parsing(format!("response element {} missing", msg_name))
        })?;
        for (name, slot) in self.res_names.iter().zip(self.res_vals.iter_mut()) {
            let value = xml::read_tag(body, name).ok_or_else(|| {
                CommError::Parsing(format!("response field {} missing", name))
            })?;
            *slot = value.to_owned();
        }
        Ok(())
    }

    /// Value of a parsed response field.
    pub fn res_val(&self, name: &str) -> Option<&str> {
        self.res_names
            .iter()
            .position(|n| n == name)
            .map(|i| self.res_vals[i].as_str())
    }

    /// Search request and response fields alike.
    pub fn search(&self, name: &str) -> Option<&str> {
        if self.req_name == name {
            return Some(&self.req_val);
        }
        self.res_val(name)
    }
}
