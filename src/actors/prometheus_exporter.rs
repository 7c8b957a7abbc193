//! Serves `crate::metrics::REGISTRY` over HTTP, grounded word-for-word on
//! `data_analyzer::actors::prometheus_exporter`: a hyper server bound to a
//! configured address, one unconditional handler that gathers and encodes
//! the registry on every request. No routing, no auth — this is a
//! scrape-only endpoint.

use anyhow::Result;
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, Server};
use log::{error, info};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;
use crate::register::Register;

struct PrometheusExporter {
    bind_address: String,
}

impl PrometheusExporter {
    fn new(register: &Register) -> Self {
        PrometheusExporter {
            bind_address: register.config.get_prometheus_exporter_bind_address(),
        }
    }

    async fn run(self) {
        let addr = match self.bind_address.parse() {
            Ok(addr) => addr,
            Err(err) => {
                error!("invalid prometheus_exporter bind address {}: {err}", self.bind_address);
                return;
            }
        };

        let make_svc = make_service_fn(|_conn| async {
            Ok::<_, hyper::Error>(service_fn(|_req| async {
                let encoder = TextEncoder::new();
                let metric_families = REGISTRY.gather();
                let mut buffer = Vec::new();
                encoder.encode(&metric_families, &mut buffer).unwrap();

                Ok::<_, hyper::Error>(
                    Response::builder()
                        .status(200)
                        .header(CONTENT_TYPE, encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap(),
                )
            }))
        });

        info!("prometheus exporter listening on http://{addr}");
        if let Err(err) = Server::bind(&addr).serve(make_svc).await {
            error!("prometheus exporter server error: {err}");
        }
    }
}

#[derive(Clone)]
pub struct PrometheusExporterHandle;

impl PrometheusExporterHandle {
    pub async fn setup_and_run(register: &Register) -> Result<Self> {
        let exporter = PrometheusExporter::new(register);
        tokio::spawn(exporter.run());
        Ok(PrometheusExporterHandle)
    }
}
