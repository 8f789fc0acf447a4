#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use nmdc_link_toolkit::error::NmdcError;
use nmdc_link_toolkit::transport::{NmdcTransport, QueryParams};

/// Replays canned responses in order and records every request.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<Value, NmdcError>>>,
    calls: Mutex<Vec<(String, QueryParams)>>,
    bodies: Mutex<Vec<Value>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<Value, NmdcError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::default(),
            bodies: Mutex::default(),
        }
    }

    /// Shared handle, for APIs that need a `Clone` transport.
    pub fn shared(responses: Vec<Result<Value, NmdcError>>) -> Arc<Self> {
        Arc::new(Self::new(responses))
    }

    pub fn calls(&self) -> Vec<(String, QueryParams)> {
        self.calls.lock().unwrap().clone()
    }

    /// JSON bodies of the POST requests, in order.
    pub fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }

    fn next(&self, path: &str, query: &[(String, String)]) -> Result<Value, NmdcError> {
        self.calls
            .lock()
            .unwrap()
            .push((path.to_string(), query.to_vec()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected request to {path}"))
    }
}

impl NmdcTransport for ScriptedTransport {
    fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<Value, NmdcError> {
        self.next(path, query)
    }

    fn post_json(
        &self,
        path: &str,
        query: &[(String, String)],
        body: &Value,
    ) -> Result<Value, NmdcError> {
        self.bodies.lock().unwrap().push(body.clone());
        self.next(path, query)
    }
}

pub fn param<'a>(params: &'a QueryParams, key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

pub fn params<'a>(params: &'a QueryParams, key: &str) -> Vec<&'a str> {
    params
        .iter()
        .filter(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
        .collect()
}
