//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use device_plugin_pb::api::registration_server::Registration;
use device_plugin_pb::api::registration_server::RegistrationServer;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::RegisterRequest;
use error_stack::Report;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use vfio_device_plugin::discovery::DeviceDiscovery;
use vfio_device_plugin::discovery::DeviceRecord;
use vfio_device_plugin::discovery::DiscoveryError;

#[derive(Debug, Clone, Default)]
struct RegistrationRecorder {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for RegistrationRecorder {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.requests
            .lock()
            .expect("registration lock poisoned")
            .push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// Kubelet registration endpoint recording every request it receives.
pub struct FakeKubelet {
    recorder: RegistrationRecorder,
    stop: CancellationToken,
    server: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl FakeKubelet {
    pub async fn start(socket: &Path) -> Self {
        if socket.exists() {
            std::fs::remove_file(socket).expect("should remove old kubelet socket");
        }
        let listener = UnixListener::bind(socket).expect("should bind kubelet socket");
        let recorder = RegistrationRecorder::default();
        let stop = CancellationToken::new();

        let service = RegistrationServer::new(recorder.clone());
        let shutdown = stop.clone().cancelled_owned();
        let server = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    shutdown,
                )
                .await
        });

        Self {
            recorder,
            stop,
            server,
        }
    }

    pub fn requests(&self) -> Vec<RegisterRequest> {
        self.recorder
            .requests
            .lock()
            .expect("registration lock poisoned")
            .clone()
    }

    pub async fn stop(self) {
        self.stop.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server).await;
    }
}

/// Discovery returning whatever records the test currently holds.
#[derive(Clone, Default)]
pub struct FixedScan {
    pub devices: Arc<Mutex<Vec<DeviceRecord>>>,
}

impl FixedScan {
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        Self {
            devices: Arc::new(Mutex::new(devices)),
        }
    }

    pub fn replace(&self, devices: Vec<DeviceRecord>) {
        *self.devices.lock().expect("device lock poisoned") = devices;
    }
}

impl DeviceDiscovery for FixedScan {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn scan(&self) -> Result<Vec<DeviceRecord>, Report<DiscoveryError>> {
        Ok(self.devices.lock().expect("device lock poisoned").clone())
    }
}

/// Discovery whose scan root is always unreadable.
pub struct BrokenScan;

impl DeviceDiscovery for BrokenScan {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn scan(&self) -> Result<Vec<DeviceRecord>, Report<DiscoveryError>> {
        Err(Report::new(DiscoveryError::ScanRoot {
            path: "/sys/bus/pci/drivers/vfio-pci".into(),
        }))
    }
}

pub fn record(pci_address: &str, iommu_group: &str, vf_index: u32) -> DeviceRecord {
    DeviceRecord {
        pci_address: pci_address.to_string(),
        vendor_id: "8086".to_string(),
        device_id: "154c".to_string(),
        iommu_group: iommu_group.to_string(),
        pf_name: "eth0".to_string(),
        vf_index,
    }
}

/// The two virtual functions of `eth0` used throughout the tests.
pub fn eth0_pair() -> Vec<DeviceRecord> {
    vec![
        record("0000:01:00.0", "12", 0),
        record("0000:01:00.1", "13", 1),
    ]
}

/// Poll `condition` until it holds, failing the test after ten seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition should hold within the deadline");
}
