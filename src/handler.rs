use std::convert::Infallible;
use std::sync::Arc;

use ethers::providers::JsonRpcClient;
use ethers::types::Address;
use ethers::utils::keccak256;
use serde::Deserialize;
use tokio::sync::mpsc;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::chainlink::JobService;
use crate::store::{CredentialStore, Subscription, SubscriptionStore};
use crate::tx_submitter::{
    process_fulfillment, FulfillmentEnvelope, TransactionSubmitter,
};

/// Access key header the Chainlink node sends on initiator calls.
pub const ACCESS_KEY_HEADER: &str = "x-chainlink-ea-accesskey";
/// Secret header the Chainlink node sends on initiator calls.
pub const SECRET_HEADER: &str = "x-chainlink-ea-secret";

/// A job registration from the Chainlink node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    /// The job spec id to watch for.
    pub job_id: String,
    /// The initiator parameters of the job spec.
    pub params: SubscriptionParams,
}

/// The initiator parameters of a job spec.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionParams {
    /// The oracle contract to watch.
    pub address: Address,
}

/// A fulfillment request from the Chainlink node.
#[derive(Debug, Clone, Deserialize)]
pub struct FulfillmentRequest {
    /// The job run this fulfillment belongs to.
    pub id: String,
    /// The fulfillment payload.
    pub data: FulfillmentEnvelope,
}

/// Hex keccak-256 of a presented credential, the form credentials are
/// stored and compared in.
pub fn hash_credential(value: &str) -> String {
    hex::encode(keccak256(value.as_bytes()))
}

/// The routes of the initiator webhook server: a healthcheck, job
/// registration and unsubscription acknowledgment.
pub fn initiator_routes<S>(
    store: S,
    subscriptions: mpsc::Sender<Subscription>,
) -> BoxedFilter<(impl Reply,)>
where
    S: SubscriptionStore + CredentialStore + 'static,
{
    let store_filter = warp::any().map(move || store.clone());
    let subscriptions_filter =
        warp::any().map(move || subscriptions.clone());
    let health = warp::path::end().and(warp::get()).map(|| StatusCode::OK);
    let subscribe = warp::path("initiator")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::header::optional::<String>(ACCESS_KEY_HEADER))
        .and(warp::header::optional::<String>(SECRET_HEADER))
        .and(warp::body::json())
        .and(store_filter)
        .and(subscriptions_filter)
        .and_then(handle_subscribe);
    // removal semantics live with the Chainlink node; just acknowledge.
    let unsubscribe = warp::path("initiator")
        .and(warp::path::end())
        .and(warp::delete())
        .map(|| StatusCode::OK);
    health.or(subscribe).or(unsubscribe).boxed()
}

async fn handle_subscribe<S>(
    access_key: Option<String>,
    secret: Option<String>,
    body: SubscriptionRequest,
    store: S,
    subscriptions: mpsc::Sender<Subscription>,
) -> Result<warp::reply::Response, Infallible>
where
    S: SubscriptionStore + CredentialStore,
{
    let (access_key, secret) = match (access_key, secret) {
        (Some(access_key), Some(secret)) => (access_key, secret),
        _ => return Ok(StatusCode::UNAUTHORIZED.into_response()),
    };
    // a missing credential set is indistinguishable from a mismatch.
    let credentials = match store.initiator_credentials() {
        Ok(Some(credentials)) => credentials,
        Ok(None) => return Ok(StatusCode::UNAUTHORIZED.into_response()),
        Err(e) => {
            tracing::error!("Failed to load initiator credentials: {}", e);
            return Ok(
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            );
        }
    };
    if hash_credential(&access_key) != credentials.outgoing_access_key_hash
        || hash_credential(&secret) != credentials.outgoing_secret_hash
    {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    }
    tracing::info!(
        job_id = %body.job_id,
        address = %body.params.address,
        "Received a new job from Chainlink, adding to the subscriptions",
    );
    let subscription = Subscription {
        job_id: body.job_id,
        contract_address: body.params.address,
    };
    if let Err(e) = store.insert_subscription(&subscription) {
        tracing::error!("Failed to save the subscription: {}", e);
        return Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }
    if subscriptions.send(subscription).await.is_err() {
        tracing::error!("Subscription dispatcher is gone");
        return Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }
    Ok(StatusCode::OK.into_response())
}

/// The routes of the adapter webhook server: a healthcheck and the
/// fulfillment endpoint.
pub fn adapter_routes<P, A, S>(
    submitter: Arc<TransactionSubmitter<P>>,
    api: Arc<A>,
    store: S,
) -> BoxedFilter<(impl Reply,)>
where
    P: JsonRpcClient + 'static,
    A: JobService + 'static,
    S: CredentialStore + 'static,
{
    let submitter_filter = warp::any().map(move || submitter.clone());
    let api_filter = warp::any().map(move || api.clone());
    let store_filter = warp::any().map(move || store.clone());
    let health = warp::path::end().and(warp::get()).map(|| StatusCode::OK);
    let fulfill = warp::path("adapter")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::json())
        .and(submitter_filter)
        .and(api_filter)
        .and(store_filter)
        .and_then(handle_fulfillment);
    health.or(fulfill).boxed()
}

async fn handle_fulfillment<P, A, S>(
    authorization: Option<String>,
    body: FulfillmentRequest,
    submitter: Arc<TransactionSubmitter<P>>,
    api: Arc<A>,
    store: S,
) -> Result<warp::reply::Response, Infallible>
where
    P: JsonRpcClient + 'static,
    A: JobService + 'static,
    S: CredentialStore + 'static,
{
    let token = match authorization
        .as_deref()
        .and_then(|header| header.strip_prefix("Bearer "))
    {
        Some(token) => token.to_string(),
        None => return Ok(StatusCode::UNAUTHORIZED.into_response()),
    };
    let credentials = match store.adapter_credentials() {
        Ok(Some(credentials)) => credentials,
        Ok(None) => return Ok(StatusCode::UNAUTHORIZED.into_response()),
        Err(e) => {
            tracing::error!("Failed to load adapter credentials: {}", e);
            return Ok(
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            );
        }
    };
    if hash_credential(&token) != credentials.outgoing_token_hash {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    }
    tracing::info!(
        run_id = %body.id,
        "Adapter received fulfillment request",
    );
    // acknowledge as pending right away; the chain work continues on a
    // background task and reports through the runs API.
    tokio::spawn(process_fulfillment(
        submitter,
        api,
        store,
        body.id.clone(),
        body.data,
    ));
    let ack = serde_json::json!({
        "jobRunID": body.id,
        "data": {},
        "status": "pending",
        "pending": true,
        "error": null,
    });
    Ok(warp::reply::json(&ack).into_response())
}
