//! SMART protocol: `{method, params}` requests to Tapo devices and to Kasa
//! devices with SMART firmware.
//!
//! Several methods are combined into `multipleRequest` batches. Devices differ
//! in how well they handle those:
//!
//! - some reject `multipleRequest` outright; multi-requests are then disabled
//!   until [`SmartProtocol::close`] and every method is sent alone
//! - some silently leave entries out of the `responses` list; only the missing
//!   methods are queried again, for a bounded number of rounds
//! - a few methods are never accepted in a batch
//!
//! List results carrying `start_index` and `sum` are paged through
//! transparently.

use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    config::DeviceConfig,
    error::{Error, SmartErrorCode},
    protocol::{RetryPolicy, send_with_retry},
    transport::{DeviceTransport, Transport, request_time_millis},
};

/// Methods per `multipleRequest` when the configuration does not say.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Re-query rounds for entries missing from a batch response.
pub const MAX_REQUERY_ROUNDS: usize = 3;

/// Upper bound on list pages fetched for one method.
pub const MAX_LIST_PAGES: usize = 50;

/// Methods devices refuse inside `multipleRequest`.
const FORCE_SINGLE_REQUEST: &[&str] = &["getConnectStatus", "scanApList"];

const MULTI_REQUEST_METHOD: &str = "multipleRequest";

/// One method call.
#[derive(Debug, Clone, PartialEq)]
pub struct SmartRequest {
    pub method: String,
    pub params: Option<Value>,
}

impl SmartRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    fn to_json(&self) -> Value {
        let mut request = json!({"method": self.method});
        if let Some(params) = &self.params {
            request["params"] = params.clone();
        }
        request
    }

    fn is_batchable(&self) -> bool {
        !FORCE_SINGLE_REQUEST.contains(&self.method.as_str())
    }
}

/// Result of one method call: its `result` object or the device's error code.
pub type MethodResult = Result<Value, SmartErrorCode>;

struct SmartSession {
    transport: DeviceTransport,
    multi_request: bool,
    request_id: u64,
}

/// Protocol for SMART devices.
///
/// # Example
///
/// ```no_run
/// use kasa_protocol::{
///     Credentials, DeviceConfig, DeviceConnectionParameters, DeviceFamily, EncryptionType,
///     SmartProtocol,
/// };
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = DeviceConfig::new("192.168.1.120")
///         .with_connection_type(DeviceConnectionParameters::new(
///             DeviceFamily::SmartTapoPlug,
///             EncryptionType::Klap,
///         ))
///         .with_credentials(Credentials::new("user@example.com", "password"));
///     let protocol = SmartProtocol::from_config(&config)?;
///
///     let response = protocol
///         .query(&json!({"get_device_info": null, "get_device_usage": null}))
///         .await?;
///     println!("{}", response["get_device_info"]["model"]);
///     Ok(())
/// }
/// ```
pub struct SmartProtocol {
    session: Mutex<SmartSession>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl SmartProtocol {
    pub fn new(transport: DeviceTransport, batch_size: usize) -> Self {
        Self {
            session: Mutex::new(SmartSession {
                transport,
                multi_request: true,
                request_id: 0,
            }),
            batch_size: batch_size.max(1),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self, Error> {
        Ok(Self::new(
            DeviceTransport::from_config(config)?,
            config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        ))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Queries one method (`"get_device_info"`) or several
    /// (`{"get_device_info": null, "get_energy_usage": {...}}`).
    ///
    /// The response maps each method to its result. With a single method its
    /// error code is raised; with several, failed methods map to
    /// `{"error_code": n}` instead.
    pub async fn query(&self, request: &Value) -> Result<Value, Error> {
        let requests = parse_query(request)?;
        if let [single] = requests.as_slice() {
            let mut session = self.session.lock().await;
            let result = self.single(&mut session, single).await?;
            let mut response = Map::new();
            response.insert(single.method.clone(), result);
            return Ok(Value::Object(response));
        }

        let results = self.query_many(&requests).await?;
        let mut response = Map::new();
        for (request, result) in requests.iter().zip(results) {
            let value = match result {
                Ok(value) => value,
                Err(code) => json!({"error_code": code.code()}),
            };
            response.insert(request.method.clone(), value);
        }
        Ok(Value::Object(response))
    }

    /// Runs several method calls, in as few round trips as the device allows.
    ///
    /// Results are in request order. Transport failures fail the whole call;
    /// device error codes are reported per method.
    pub async fn query_many(&self, requests: &[SmartRequest]) -> Result<Vec<MethodResult>, Error> {
        let mut session = self.session.lock().await;
        let mut results: Vec<Option<MethodResult>> = vec![None; requests.len()];

        for (index, request) in requests.iter().enumerate() {
            if !request.is_batchable() {
                results[index] = Some(self.single_entry(&mut session, request).await?);
            }
        }

        for round in 0..=MAX_REQUERY_ROUNDS {
            let pending: Vec<usize> = (0..requests.len())
                .filter(|&i| results[i].is_none())
                .collect();
            if pending.is_empty() {
                break;
            }
            if round > 0 {
                debug!(
                    round,
                    missing = pending.len(),
                    "re-querying missing entries"
                );
            }

            if pending.len() == 1 || !session.multi_request {
                for index in pending {
                    results[index] = Some(self.single_entry(&mut session, &requests[index]).await?);
                }
                continue;
            }

            for chunk in pending.chunks(self.batch_size) {
                if session.multi_request {
                    self.batch(&mut session, requests, chunk, &mut results)
                        .await?;
                }
                if !session.multi_request {
                    for &index in chunk {
                        if results[index].is_none() {
                            results[index] =
                                Some(self.single_entry(&mut session, &requests[index]).await?);
                        }
                    }
                }
            }
        }

        Ok(results
            .into_iter()
            .zip(requests)
            .map(|(result, request)| {
                result.unwrap_or_else(|| {
                    warn!(method = %request.method, "no response after re-querying");
                    Err(SmartErrorCode::InternalQuery)
                })
            })
            .collect())
    }

    /// Closes the transport and re-enables multi-requests.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        session.transport.close().await;
        session.multi_request = true;
    }

    /// Whether batches are currently sent as `multipleRequest`.
    pub async fn multi_request_enabled(&self) -> bool {
        self.session.lock().await.multi_request
    }

    pub async fn credentials_hash(&self) -> Option<String> {
        self.session.lock().await.transport.credentials_hash()
    }

    /// Sends one method and returns its `result`, raising the device's error
    /// code. List results are paged through.
    async fn single(
        &self,
        session: &mut SmartSession,
        request: &SmartRequest,
    ) -> Result<Value, Error> {
        let mut result = self.call(session, &request.to_json()).await?;
        self.follow_pages(session, request, &mut result).await?;
        Ok(result)
    }

    /// Like [`single`](Self::single), with device error codes as values.
    async fn single_entry(
        &self,
        session: &mut SmartSession,
        request: &SmartRequest,
    ) -> Result<MethodResult, Error> {
        match self.single(session, request).await {
            Ok(value) => Ok(Ok(value)),
            Err(err) => entry_error(err).map(Err),
        }
    }

    /// Sends `chunk` as one `multipleRequest` and stores the entries that came
    /// back. Disables multi-requests if the device cannot handle them.
    async fn batch(
        &self,
        session: &mut SmartSession,
        requests: &[SmartRequest],
        chunk: &[usize],
        results: &mut [Option<MethodResult>],
    ) -> Result<(), Error> {
        let batch: Vec<Value> = chunk.iter().map(|&i| requests[i].to_json()).collect();
        let request = json!({
            "method": MULTI_REQUEST_METHOD,
            "params": {"requests": batch},
        });

        let result = match self.call(session, &request).await {
            Ok(result) => result,
            Err(Error::Device { code, .. }) if disables_multi_request(code) => {
                self.disable_multi_request(session, &format!("device answered {code}"));
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let Some(responses) = result.get("responses").and_then(Value::as_array) else {
            self.disable_multi_request(session, "malformed responses list");
            return Ok(());
        };

        debug!(
            requested = chunk.len(),
            received = responses.len(),
            "multi-request response"
        );
        for response in responses {
            let Some(method) = response.get("method").and_then(Value::as_str) else {
                continue;
            };
            let Some(&index) = chunk
                .iter()
                .find(|&&i| requests[i].method == method && results[i].is_none())
            else {
                continue;
            };
            let code = response
                .get("error_code")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let entry = if code == 0 {
                let mut value = response.get("result").cloned().unwrap_or(json!({}));
                let request = &requests[index];
                match self.follow_pages(session, request, &mut value).await {
                    Ok(()) => Ok(value),
                    Err(err) => entry_error(err).map(Err)?,
                }
            } else {
                Err(SmartErrorCode::from_code(code as i32))
            };
            results[index] = Some(entry);
        }
        Ok(())
    }

    fn disable_multi_request(&self, session: &mut SmartSession, reason: &str) {
        warn!(
            host = %session.transport.host(),
            reason,
            "multi-request not supported, sending requests individually"
        );
        session.multi_request = false;
    }

    /// Fetches further pages while the list is shorter than `sum`.
    async fn follow_pages(
        &self,
        session: &mut SmartSession,
        request: &SmartRequest,
        result: &mut Value,
    ) -> Result<(), Error> {
        let Some(total) = result
            .get("sum")
            .and_then(Value::as_u64)
            .filter(|_| result.get("start_index").is_some())
        else {
            return Ok(());
        };
        let Some(list_name) = result.as_object().and_then(|obj| {
            obj.iter()
                .find(|(_, v)| v.is_array())
                .map(|(k, _)| k.clone())
        }) else {
            return Ok(());
        };

        for _ in 1..MAX_LIST_PAGES {
            let fetched = result[&list_name].as_array().map_or(0, Vec::len);
            if fetched as u64 >= total {
                break;
            }

            let mut params = request.params.clone().unwrap_or_else(|| json!({}));
            let Some(obj) = params.as_object_mut() else {
                warn!(method = %request.method, fetched, total, "cannot page non-object params");
                break;
            };
            obj.insert("start_index".into(), json!(fetched));
            debug!(
                method = %request.method,
                start_index = fetched,
                total,
                "fetching next page"
            );
            let page = SmartRequest::new(request.method.clone()).with_params(params);
            let page = self.call(session, &page.to_json()).await?;

            let items = page
                .get(&list_name)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if items.is_empty() {
                break;
            }
            if let Some(list) = result[&list_name].as_array_mut() {
                list.extend(items);
            }
        }
        Ok(())
    }

    /// Sends one request envelope, with retries, and returns its `result`.
    async fn call(&self, session: &mut SmartSession, request: &Value) -> Result<Value, Error> {
        session.request_id += 1;
        let mut envelope = request.clone();
        envelope["requestID"] = json!(session.request_id);
        envelope["request_time_milis"] = json!(request_time_millis());

        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let text = envelope.to_string();
        let response = send_with_retry(&mut session.transport, &self.retry, &text, |response| {
            check_error_code(response, method)
        })
        .await?;
        Ok(response.get("result").cloned().unwrap_or(json!({})))
    }
}

impl std::fmt::Debug for SmartProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartProtocol")
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn parse_query(request: &Value) -> Result<Vec<SmartRequest>, Error> {
    match request {
        Value::String(method) => Ok(vec![SmartRequest::new(method.clone())]),
        Value::Object(map) if !map.is_empty() => Ok(map
            .iter()
            .map(|(method, params)| SmartRequest {
                method: method.clone(),
                params: (!params.is_null()).then(|| params.clone()),
            })
            .collect()),
        _ => Err(Error::Protocol(
            "query must be a method name or a non-empty object of methods".into(),
        )),
    }
}

fn check_error_code(response: &Value, method: &str) -> Result<(), Error> {
    match response.get("error_code").and_then(Value::as_i64) {
        Some(0) | None => Ok(()),
        Some(code) => Err(Error::from_smart_code(
            SmartErrorCode::from_code(code as i32),
            method,
        )),
    }
}

/// Device errors become per-method codes; everything else fails the query.
fn entry_error(err: Error) -> Result<SmartErrorCode, Error> {
    match err {
        Error::Device { code, .. } => Ok(code),
        other => Err(other),
    }
}

fn disables_multi_request(code: SmartErrorCode) -> bool {
    matches!(
        code,
        SmartErrorCode::UnknownMethod
            | SmartErrorCode::JsonDecodeFail
            | SmartErrorCode::Params
            | SmartErrorCode::Other(_)
    )
}
