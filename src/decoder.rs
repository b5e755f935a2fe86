use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use serde_json::{Map, Value};

use crate::events_watcher::RawLogEvent;

/// The solidity signature of the event consumed by the bridge.
pub const ORACLE_REQUEST_SIGNATURE: &str =
    "OracleRequest(bytes32,address,bytes32,uint256,address,bytes4,uint256,uint256,bytes)";

/// The topic hash identifying `OracleRequest` logs.
pub fn oracle_request_topic() -> H256 {
    H256::from(keccak256(ORACLE_REQUEST_SIGNATURE.as_bytes()))
}

/// An enum of all the ways an `OracleRequest` log can fail to decode.
///
/// A decode failure drops the offending event only; the watcher and any
/// other pending events are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The log has no job spec topic.
    #[error("log is missing the job spec topic")]
    MissingSpecTopic,
    /// The job spec topic is not valid UTF-8.
    #[error("job spec topic is not valid utf-8: {}", _0)]
    JobId(#[from] std::string::FromUtf8Error),
    /// The log body does not match the event layout.
    #[error(transparent)]
    Abi(#[from] abi::Error),
    /// The log body decoded into unexpected token types.
    #[error("log body decoded into an unexpected token layout")]
    UnexpectedLayout,
    /// The request parameters are not a decodable map.
    #[error("invalid request parameters: {}", _0)]
    Cbor(String),
}

/// A structured oracle request, derived once per confirmed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    /// Identifier the fulfillment callback must echo back.
    pub request_id: H256,
    /// The account that placed the request.
    pub requester: Address,
    /// Payment attached to the request, in wei.
    pub payment: U256,
    /// The contract to deliver the result to.
    pub callback_address: Address,
    /// Selector of the callback function on `callback_address`.
    pub callback_function_id: [u8; 4],
    /// Timestamp after which the requester may cancel.
    pub cancel_expiration: U256,
    /// Version of the request parameter encoding.
    pub data_version: U256,
    /// The decoded request parameters; empty when the request carried no
    /// data field.
    pub parameters: Map<String, Value>,
}

/// Decodes a raw `OracleRequest` log into a structured request.
///
/// Pure function; the fixed field order and types of the event are a
/// contract, not configurable.
pub fn decode_oracle_request(
    event: &RawLogEvent,
) -> Result<OracleRequest, DecodeError> {
    let spec_topic =
        event.topics.get(1).ok_or(DecodeError::MissingSpecTopic)?;
    decode_job_id(spec_topic)?;

    let mut tokens = abi::decode(
        &[
            ParamType::Address,
            ParamType::FixedBytes(32),
            ParamType::Uint(256),
            ParamType::Address,
            ParamType::FixedBytes(4),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Bytes,
        ],
        &event.data,
    )?
    .into_iter();

    let requester = next_address(&mut tokens)?;
    let request_id = next_hash(&mut tokens)?;
    let payment = next_uint(&mut tokens)?;
    let callback_address = next_address(&mut tokens)?;
    let callback_function_id = next_selector(&mut tokens)?;
    let cancel_expiration = next_uint(&mut tokens)?;
    let data_version = next_uint(&mut tokens)?;
    let data = next_bytes(&mut tokens)?;

    let parameters = if data.is_empty() {
        Map::new()
    } else {
        decode_parameters(&data)?
    };

    Ok(OracleRequest {
        request_id,
        requester,
        payment,
        callback_address,
        callback_function_id,
        cancel_expiration,
        data_version,
        parameters,
    })
}

/// Decodes the job spec id out of its 32 byte topic: the id is UTF-8,
/// right-padded with zeros.
pub fn decode_job_id(topic: &H256) -> Result<String, DecodeError> {
    let bytes = topic.as_bytes();
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8(bytes[..end].to_vec())?)
}

/// Decodes the request `data` field into a parameter map.
///
/// The on-chain encoder writes the map entries without any enclosing map
/// header, so the buffer is framed with the indefinite-length map markers
/// (`0xbf` .. `0xff`) to make it a self-describing CBOR document before
/// handing it to the decoder.
fn decode_parameters(data: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    let mut framed = Vec::with_capacity(data.len() + 2);
    framed.push(0xbf);
    framed.extend_from_slice(data);
    framed.push(0xff);
    let value: ciborium::value::Value =
        ciborium::de::from_reader(framed.as_slice())
            .map_err(|e| DecodeError::Cbor(e.to_string()))?;
    match cbor_to_json(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::Cbor(
            "request parameters are not a map".to_string(),
        )),
    }
}

fn cbor_to_json(value: ciborium::value::Value) -> Result<Value, DecodeError> {
    use ciborium::value::Value as Cbor;
    let json = match value {
        Cbor::Null => Value::Null,
        Cbor::Bool(b) => Value::from(b),
        Cbor::Integer(i) => {
            let i = i128::from(i);
            if let Ok(small) = i64::try_from(i) {
                Value::from(small)
            } else if let Ok(big) = u64::try_from(i) {
                Value::from(big)
            } else {
                // out of JSON number range; keep the digits.
                Value::from(i.to_string())
            }
        }
        Cbor::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| {
                DecodeError::Cbor("non-finite float parameter".to_string())
            })?,
        Cbor::Bytes(bytes) => Value::from(format!("0x{}", hex::encode(bytes))),
        Cbor::Text(text) => Value::from(text),
        Cbor::Array(values) => Value::Array(
            values
                .into_iter()
                .map(cbor_to_json)
                .collect::<Result<_, _>>()?,
        ),
        Cbor::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let key = match key {
                    Cbor::Text(text) => text,
                    other => {
                        return Err(DecodeError::Cbor(format!(
                            "unsupported parameter key: {:?}",
                            other
                        )))
                    }
                };
                map.insert(key, cbor_to_json(value)?);
            }
            Value::Object(map)
        }
        Cbor::Tag(_, inner) => cbor_to_json(*inner)?,
        other => {
            return Err(DecodeError::Cbor(format!(
                "unsupported parameter value: {:?}",
                other
            )))
        }
    };
    Ok(json)
}

fn next_address(
    tokens: &mut impl Iterator<Item = Token>,
) -> Result<Address, DecodeError> {
    match tokens.next() {
        Some(Token::Address(address)) => Ok(address),
        _ => Err(DecodeError::UnexpectedLayout),
    }
}

fn next_uint(
    tokens: &mut impl Iterator<Item = Token>,
) -> Result<U256, DecodeError> {
    match tokens.next() {
        Some(Token::Uint(value)) => Ok(value),
        _ => Err(DecodeError::UnexpectedLayout),
    }
}

fn next_hash(
    tokens: &mut impl Iterator<Item = Token>,
) -> Result<H256, DecodeError> {
    match tokens.next() {
        Some(Token::FixedBytes(bytes)) if bytes.len() == 32 => {
            Ok(H256::from_slice(&bytes))
        }
        _ => Err(DecodeError::UnexpectedLayout),
    }
}

fn next_selector(
    tokens: &mut impl Iterator<Item = Token>,
) -> Result<[u8; 4], DecodeError> {
    match tokens.next() {
        Some(Token::FixedBytes(bytes)) if bytes.len() == 4 => {
            let mut selector = [0u8; 4];
            selector.copy_from_slice(&bytes);
            Ok(selector)
        }
        _ => Err(DecodeError::UnexpectedLayout),
    }
}

fn next_bytes(
    tokens: &mut impl Iterator<Item = Token>,
) -> Result<Vec<u8>, DecodeError> {
    match tokens.next() {
        Some(Token::Bytes(bytes)) => Ok(bytes),
        _ => Err(DecodeError::UnexpectedLayout),
    }
}
