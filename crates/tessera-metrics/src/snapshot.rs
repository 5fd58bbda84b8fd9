// Copyright 2025 Tessera Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Latency distribution in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Counters for logical requests (one per caller submission)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Requests completed with an empty result after an ignored error
    pub ignored: u64,
    pub overall_timeouts: u64,
    /// Attempts sent, speculative ones included
    pub attempts: u64,
    pub retries: u64,
    pub speculative_executions: u64,
    pub latency: LatencySummary,
}

/// Metrics for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub node_addr: String,
    pub attempts: u64,
    pub successes: u64,
    pub errors: u64,
    pub latency: LatencySummary,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_ms: u64,
    pub requests: RequestMetrics,
    /// Terminal failures by error kind
    pub errors: HashMap<String, u64>,
    pub nodes: HashMap<String, NodeMetrics>,
}
