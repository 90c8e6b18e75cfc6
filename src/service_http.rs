//! HTTP implementation of [`StreamServiceApi`], speaking an
//! AWS-Kinesis-JSON-1.1-style wire protocol: one POST per RPC, an
//! `X-Amz-Target`-style header naming the operation, a JSON body, and
//! base64-encoded record payloads.

use crate::error::StreamError;
use crate::service::{
    FetchedRecord, GetRecordsOutcome, IteratorHandle, PutRecordEntry, PutRecordError,
    PutRecordErrorCode, PutRecordResult, ShardDescription, StreamDescription, StreamServiceApi,
    StreamStatus,
};
use crate::types::{IteratorPosition, SequenceNumber, ShardId};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{Duration, UNIX_EPOCH};

const TARGET_PREFIX: &str = "ShardStream_20240101";

/// An HTTP-backed `StreamServiceApi`, cloneable and shareable across
/// tasks. Holds a pooled `reqwest::Client` the same way the client this
/// crate started from pools its connections.
#[derive(Clone)]
pub struct HttpStreamServiceApi {
    inner: reqwest::Client,
    endpoint: String,
}

impl HttpStreamServiceApi {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::builder(endpoint).build()
    }

    pub fn builder(endpoint: impl Into<String>) -> HttpStreamServiceApiBuilder {
        HttpStreamServiceApiBuilder {
            endpoint: endpoint.into(),
            timeout: None,
        }
    }

    async fn call<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        operation: &str,
        body: &Req,
    ) -> Result<Resp, StreamError> {
        let target = format!("{TARGET_PREFIX}.{operation}");
        let response = self
            .inner
            .post(&self.endpoint)
            .header("X-Amz-Target", target)
            .header("Content-Type", "application/x-amz-json-1.1")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<Resp>().await?);
        }

        let body: ServiceErrorBody = response
            .json()
            .await
            .unwrap_or_else(|_| ServiceErrorBody {
                error_type: "UnknownError".to_string(),
                message: format!("HTTP {status}"),
            });
        Err(map_service_error(&body, status.as_u16()))
    }
}

#[derive(Clone)]
pub struct HttpStreamServiceApiBuilder {
    endpoint: String,
    timeout: Option<Duration>,
}

impl HttpStreamServiceApiBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<HttpStreamServiceApi, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(HttpStreamServiceApi {
            inner: builder.build()?,
            endpoint: self.endpoint,
        })
    }
}

#[derive(Deserialize)]
struct ServiceErrorBody {
    #[serde(rename = "__type")]
    error_type: String,
    #[serde(default)]
    message: String,
}

fn map_service_error(body: &ServiceErrorBody, status: u16) -> StreamError {
    match body.error_type.as_str() {
        "ResourceNotFoundException" => StreamError::StreamDoesNotExist {
            name: body.message.clone(),
        },
        "ResourceInUseException" => StreamError::StreamExists {
            name: body.message.clone(),
        },
        "LimitExceededException" => StreamError::StreamShardLimit {
            name: body.message.clone(),
        },
        "ProvisionedThroughputExceededException" => StreamError::Throttled { retry_after: None },
        _ if status >= 500 => StreamError::ServiceInternal {
            message: body.message.clone(),
        },
        _ => StreamError::ServiceInternal {
            message: format!("{}: {}", body.error_type, body.message),
        },
    }
}

fn position_params(position: &IteratorPosition) -> (&'static str, Option<String>) {
    match position {
        IteratorPosition::TrimHorizon => ("TRIM_HORIZON", None),
        IteratorPosition::Latest => ("LATEST", None),
        IteratorPosition::AtSequence(seq) => ("AT_SEQUENCE_NUMBER", Some(seq.0.clone())),
        IteratorPosition::AfterSequence(seq) => ("AFTER_SEQUENCE_NUMBER", Some(seq.0.clone())),
    }
}

#[async_trait]
impl StreamServiceApi for HttpStreamServiceApi {
    async fn create_stream(&self, name: &str, shard_count: u32) -> Result<(), StreamError> {
        #[derive(Serialize)]
        struct Req<'a> {
            #[serde(rename = "StreamName")]
            stream_name: &'a str,
            #[serde(rename = "ShardCount")]
            shard_count: u32,
        }
        #[derive(Deserialize)]
        struct Resp {}
        let _: Resp = self
            .call(
                "CreateStream",
                &Req {
                    stream_name: name,
                    shard_count,
                },
            )
            .await?;
        Ok(())
    }

    async fn delete_stream(&self, name: &str) -> Result<(), StreamError> {
        #[derive(Serialize)]
        struct Req<'a> {
            #[serde(rename = "StreamName")]
            stream_name: &'a str,
        }
        #[derive(Deserialize)]
        struct Resp {}
        let _: Resp = self
            .call("DeleteStream", &Req { stream_name: name })
            .await?;
        Ok(())
    }

    async fn describe_stream(&self, name: &str) -> Result<StreamDescription, StreamError> {
        #[derive(Serialize)]
        struct Req<'a> {
            #[serde(rename = "StreamName")]
            stream_name: &'a str,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(rename = "StreamStatus")]
            status: String,
            #[serde(rename = "ShardCount")]
            shard_count: usize,
        }
        let resp: Resp = self
            .call("DescribeStream", &Req { stream_name: name })
            .await?;
        let status = match resp.status.as_str() {
            "CREATING" => StreamStatus::Creating,
            "DELETING" => StreamStatus::Deleting,
            _ => StreamStatus::Active,
        };
        Ok(StreamDescription {
            name: name.to_string(),
            status,
            shard_count: resp.shard_count,
        })
    }

    async fn list_shards(&self, name: &str) -> Result<Vec<ShardDescription>, StreamError> {
        #[derive(Serialize)]
        struct Req<'a> {
            #[serde(rename = "StreamName")]
            stream_name: &'a str,
        }
        #[derive(Deserialize)]
        struct WireShard {
            #[serde(rename = "ShardId")]
            shard_id: String,
            #[serde(rename = "ParentShardId")]
            parent_shard_id: Option<String>,
            #[serde(rename = "AdjacentParentShardId")]
            adjacent_parent_shard_id: Option<String>,
            #[serde(rename = "IsOpen")]
            is_open: bool,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(rename = "Shards")]
            shards: Vec<WireShard>,
        }
        let resp: Resp = self
            .call("ListShards", &Req { stream_name: name })
            .await?;
        Ok(resp
            .shards
            .into_iter()
            .map(|s| ShardDescription {
                shard_id: ShardId::new(s.shard_id),
                parent_shard_id: s.parent_shard_id.map(ShardId::new),
                adjacent_parent_shard_id: s.adjacent_parent_shard_id.map(ShardId::new),
                is_open: s.is_open,
            })
            .collect())
    }

    async fn put_records(
        &self,
        name: &str,
        records: Vec<PutRecordEntry>,
    ) -> Result<Vec<PutRecordResult>, StreamError> {
        #[derive(Serialize)]
        struct WireEntry {
            #[serde(rename = "Data")]
            data: String,
            #[serde(rename = "PartitionKey")]
            partition_key: String,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            #[serde(rename = "StreamName")]
            stream_name: &'a str,
            #[serde(rename = "Records")]
            records: Vec<WireEntry>,
        }
        #[derive(Deserialize)]
        struct WireResult {
            #[serde(rename = "SequenceNumber")]
            sequence_number: Option<String>,
            #[serde(rename = "ShardId")]
            shard_id: Option<String>,
            #[serde(rename = "ErrorCode")]
            error_code: Option<String>,
            #[serde(rename = "ErrorMessage")]
            error_message: Option<String>,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(rename = "Records")]
            records: Vec<WireResult>,
        }

        let engine = base64::engine::general_purpose::STANDARD;
        let wire_records = records
            .into_iter()
            .map(|r| WireEntry {
                data: engine.encode(&r.data),
                partition_key: r.partition_key,
            })
            .collect();

        let resp: Resp = self
            .call(
                "PutRecords",
                &Req {
                    stream_name: name,
                    records: wire_records,
                },
            )
            .await?;

        Ok(resp
            .records
            .into_iter()
            .map(|r| PutRecordResult {
                sequence_number: r.sequence_number.map(SequenceNumber::new),
                shard_id: r.shard_id.map(ShardId::new),
                error: r.error_code.map(|code| PutRecordError {
                    code: match code.as_str() {
                        "ProvisionedThroughputExceededException" => {
                            PutRecordErrorCode::ProvisionedThroughputExceeded
                        }
                        _ => PutRecordErrorCode::InternalFailure,
                    },
                    message: r.error_message.unwrap_or_default(),
                }),
            })
            .collect())
    }

    async fn get_shard_iterator(
        &self,
        name: &str,
        shard_id: &ShardId,
        position: &IteratorPosition,
    ) -> Result<IteratorHandle, StreamError> {
        #[derive(Serialize)]
        struct Req<'a> {
            #[serde(rename = "StreamName")]
            stream_name: &'a str,
            #[serde(rename = "ShardId")]
            shard_id: &'a str,
            #[serde(rename = "ShardIteratorType")]
            iterator_type: &'static str,
            #[serde(rename = "StartingSequenceNumber", skip_serializing_if = "Option::is_none")]
            starting_sequence_number: Option<String>,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(rename = "ShardIterator")]
            shard_iterator: String,
        }

        let (iterator_type, starting_sequence_number) = position_params(position);
        let resp: Resp = self
            .call(
                "GetShardIterator",
                &Req {
                    stream_name: name,
                    shard_id: shard_id.as_str(),
                    iterator_type,
                    starting_sequence_number,
                },
            )
            .await?;
        Ok(IteratorHandle(resp.shard_iterator))
    }

    async fn get_records(
        &self,
        iterator: &IteratorHandle,
        limit: u32,
    ) -> Result<GetRecordsOutcome, StreamError> {
        #[derive(Serialize)]
        struct Req<'a> {
            #[serde(rename = "ShardIterator")]
            shard_iterator: &'a str,
            #[serde(rename = "Limit")]
            limit: u32,
        }
        #[derive(Deserialize)]
        struct WireRecord {
            #[serde(rename = "SequenceNumber")]
            sequence_number: String,
            #[serde(rename = "PartitionKey")]
            partition_key: String,
            #[serde(rename = "Data")]
            data: String,
            #[serde(rename = "ApproximateArrivalTimestamp")]
            arrival_timestamp: f64,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(rename = "Records")]
            records: Vec<WireRecord>,
            #[serde(rename = "NextShardIterator")]
            next_shard_iterator: Option<String>,
            #[serde(rename = "MillisBehindLatest")]
            millis_behind_latest: u64,
        }

        let resp: Resp = self
            .call(
                "GetRecords",
                &Req {
                    shard_iterator: &iterator.0,
                    limit,
                },
            )
            .await?;

        let engine = base64::engine::general_purpose::STANDARD;
        let mut records = Vec::with_capacity(resp.records.len());
        for r in resp.records {
            let data = engine
                .decode(&r.data)
                .map_err(|e| StreamError::ServiceInternal {
                    message: format!("invalid base64 payload: {e}"),
                })?;
            records.push(FetchedRecord {
                sequence_number: SequenceNumber::new(r.sequence_number),
                partition_key: r.partition_key,
                data: data.into(),
                arrival_timestamp: UNIX_EPOCH + Duration::from_secs_f64(r.arrival_timestamp),
            });
        }

        Ok(GetRecordsOutcome {
            records,
            next_iterator: resp.next_shard_iterator.map(IteratorHandle),
            millis_behind_latest: resp.millis_behind_latest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_not_found_maps_to_stream_does_not_exist() {
        let body = ServiceErrorBody {
            error_type: "ResourceNotFoundException".to_string(),
            message: "my-stream".to_string(),
        };
        assert!(matches!(
            map_service_error(&body, 400),
            StreamError::StreamDoesNotExist { .. }
        ));
    }

    #[test]
    fn throughput_exceeded_maps_to_throttled() {
        let body = ServiceErrorBody {
            error_type: "ProvisionedThroughputExceededException".to_string(),
            message: String::new(),
        };
        assert!(matches!(
            map_service_error(&body, 400),
            StreamError::Throttled { .. }
        ));
    }

    #[test]
    fn unrecognized_5xx_maps_to_service_internal() {
        let body = ServiceErrorBody {
            error_type: "SomeNewException".to_string(),
            message: "boom".to_string(),
        };
        assert!(matches!(
            map_service_error(&body, 503),
            StreamError::ServiceInternal { .. }
        ));
    }

    #[test]
    fn position_params_encode_the_four_iterator_kinds() {
        assert_eq!(
            position_params(&IteratorPosition::TrimHorizon),
            ("TRIM_HORIZON", None)
        );
        assert_eq!(position_params(&IteratorPosition::Latest), ("LATEST", None));
        assert_eq!(
            position_params(&IteratorPosition::AtSequence(SequenceNumber::new("5"))),
            ("AT_SEQUENCE_NUMBER", Some("5".to_string()))
        );
        assert_eq!(
            position_params(&IteratorPosition::AfterSequence(SequenceNumber::new("5"))),
            ("AFTER_SEQUENCE_NUMBER", Some("5".to_string()))
        );
    }
}
