use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use argus::analyzers::{Analyzer, AnalyzerInput, AnalyzerOutcome};
use argus::artifact::{ArtifactClass, FileArtifact};
use argus::bus::memory::MemoryBus;
use argus::bus::{Fields, RemoteKind, StreamBus, fields};
use argus::dispatcher::Argus;
use argus::verdict::Confidence;

struct MetadataCoherence;

#[async_trait]
impl Analyzer for MetadataCoherence {
    fn name(&self) -> &'static str {
        "metadata-coherence"
    }
    fn version(&self) -> &'static str {
        "0.3.0"
    }
    async fn analyze(&self, input: &AnalyzerInput) -> anyhow::Result<AnalyzerOutcome> {
        // Toy heuristic: larger payloads look more like camera output.
        let size = input.data.as_ref().map(|d| d.len()).unwrap_or(0);
        let score = if size > 1_000 { 0.9 } else { 0.6 };
        Ok(AnalyzerOutcome::scored(score, Confidence::High))
    }
}

struct NoiseResidue;

#[async_trait]
impl Analyzer for NoiseResidue {
    fn name(&self) -> &'static str {
        "noise-residue"
    }
    fn version(&self) -> &'static str {
        "0.1.1"
    }
    async fn analyze(&self, _input: &AnalyzerInput) -> anyhow::Result<AnalyzerOutcome> {
        Ok(AnalyzerOutcome::scored(0.8, Confidence::Medium))
    }
}

/// Loopback decision service: answers every request on the paired response
/// stream, standing in for the real networks.
async fn loopback(bus: Arc<MemoryBus>, kind: RemoteKind, reply: serde_json::Value) {
    let group = "loopback";
    if bus.ensure_group(kind.request_stream(), group).await.is_err() {
        return;
    }
    loop {
        let Ok(batch) = bus
            .consume(kind.request_stream(), group, "svc", 8, Duration::from_millis(500))
            .await
        else {
            return;
        };
        for (id, body) in batch {
            let Some(artifact) = body.get(fields::ARTIFACT_ID).cloned() else { continue };
            let mut out = Fields::new();
            out.insert(fields::ARTIFACT_ID.into(), artifact);
            out.insert(fields::PAYLOAD.into(), reply.to_string());
            let _ = bus.publish(kind.response_stream(), &out).await;
            let _ = bus.ack(kind.request_stream(), group, &id).await;
        }
    }
}

#[tokio::main]
async fn main() {
    #[cfg(feature = "argus-tracing")]
    argus::tracing::init_tracing();

    let bus = Arc::new(MemoryBus::new());
    let engine = Arc::new(
        Argus::builder()
            .bus_backend(bus.clone())
            .analyzer(Arc::new(MetadataCoherence))
            .analyzer(Arc::new(NoiseResidue))
            .build(),
    );
    engine.start();

    tokio::spawn(loopback(
        bus.clone(),
        RemoteKind::Mirror,
        json!({"networks": [{"name": "m1", "score": 0.85, "confidence": "high", "durationMs": 40}]}),
    ));
    tokio::spawn(loopback(
        bus.clone(),
        RemoteKind::Superior,
        json!({"isAuthentic": true, "confidence": 0.9}),
    ));

    let mut sample = vec![0xFF, 0xD8, 0xFF, 0xE0];
    sample.extend(std::iter::repeat(0x4A).take(100_000));
    let artifact = FileArtifact::from_bytes(sample, ArtifactClass::Image);

    match engine.submit(artifact, "demo-client", 0, None, None).await {
        Ok(verdict) => {
            println!("{}", serde_json::to_string_pretty(&verdict).unwrap());
        }
        Err(e) => {
            eprintln!("request failed ({}, correlation {})", e.category(), e.correlation_id);
        }
    }

    let health = engine.health_snapshot();
    println!("health: {}", serde_json::to_string_pretty(&health).unwrap());

    engine.shutdown().await;
}
