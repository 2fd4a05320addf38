use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use device_plugin_pb::api::device_plugin_server::DevicePlugin;
use device_plugin_pb::api::device_plugin_server::DevicePluginServer;
use device_plugin_pb::api::registration_client::RegistrationClient;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::AllocateResponse;
use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::Device;
use device_plugin_pb::api::DevicePluginOptions;
use device_plugin_pb::api::DeviceSpec;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::ListAndWatchResponse;
use device_plugin_pb::api::PreStartContainerRequest;
use device_plugin_pb::api::PreStartContainerResponse;
use device_plugin_pb::api::PreferredAllocationRequest;
use device_plugin_pb::api::PreferredAllocationResponse;
use device_plugin_pb::api::RegisterRequest;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::naming;

/// Bound on the self-connect that confirms the server accepts connections.
pub const START_TIMEOUT: Duration = Duration::from_secs(60);
/// Bound on dialing the kubelet and sending the registration.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a stopping server may take to drain before it is aborted.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const PERMISSIONS: &str = "mrw";

/// Lifecycle of one plugin server. A stopped server is never restarted,
/// a new one is created instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PluginState {
    Created,
    Listening,
    Registered,
    Serving,
    Stopped,
}

/// Device plugin serving a single VFIO device.
#[derive(Debug)]
pub struct VfioDevicePlugin {
    /// resource name (e.g. "kr-vf/eth0-vf0")
    resource_name: String,
    /// unix socket this plugin listens on
    socket: PathBuf,
    /// PCI address of the device
    pci_address: String,
    /// IOMMU group, advertised as the device id
    iommu_group: String,
    state: PluginState,
    /// fires once on stop, ends the server and every ListAndWatch stream
    stop: CancellationToken,
    server: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
}

impl VfioDevicePlugin {
    pub fn new(
        resource_name: String,
        socket: PathBuf,
        pci_address: String,
        iommu_group: String,
    ) -> Self {
        Self {
            resource_name,
            socket,
            pci_address,
            iommu_group,
            state: PluginState::Created,
            stop: CancellationToken::new(),
            server: None,
        }
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Start the server then register it with the kubelet.
    ///
    /// A server that fails either step is stopped before the error is
    /// returned, it is never left listening unregistered.
    pub async fn serve(&mut self, kubelet_socket: &Path) -> anyhow::Result<()> {
        if let Err(e) = self.start().await {
            warn!("Could not start device plugin: {e:#}");
            self.stop_quietly().await;
            return Err(e);
        }
        info!("Starting to serve on {}", self.socket.display());

        if let Err(e) = self.register(kubelet_socket).await {
            warn!("Could not register device plugin: {e:#}");
            self.stop_quietly().await;
            return Err(e);
        }
        self.state = PluginState::Serving;
        info!("Registered device plugin {} with kubelet", self.resource_name);

        Ok(())
    }

    /// start device plugin server
    pub async fn start(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.state == PluginState::Created,
            "device plugin {} cannot start from state {}",
            self.resource_name,
            self.state
        );
        info!("start device plugin server: {}", self.socket.display());

        remove_socket(&self.socket)?;

        let listener = UnixListener::bind(&self.socket)
            .with_context(|| format!("failed to bind {}", self.socket.display()))?;

        let service = DevicePluginService::new(
            self.resource_name.clone(),
            self.pci_address.clone(),
            self.iommu_group.clone(),
            self.stop.clone(),
        );
        let stop = self.stop.clone();
        let socket = self.socket.clone();

        self.server = Some(tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        stop.cancelled().await;
                        info!("shutting down gRPC server on {}", socket.display());
                    },
                )
                .await
        }));
        self.state = PluginState::Listening;

        // Wait for the server to accept by making a connection of our own
        let channel = tokio::time::timeout(START_TIMEOUT, connect_uds(&self.socket))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "timed out after {START_TIMEOUT:?} connecting to {}",
                    self.socket.display()
                )
            })??;
        drop(channel);

        Ok(())
    }

    /// register device plugin with kubelet
    pub async fn register(&mut self, kubelet_socket: &Path) -> anyhow::Result<()> {
        info!(
            "registering device plugin {} with kubelet: {}",
            self.resource_name,
            kubelet_socket.display()
        );

        let endpoint = self
            .socket
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .with_context(|| format!("socket {} has no file name", self.socket.display()))?;

        let request = RegisterRequest {
            version: device_plugin_pb::VERSION.to_string(),
            endpoint,
            resource_name: self.resource_name.clone(),
            options: Some(plugin_options()),
        };

        let registration = async {
            let channel = connect_uds(kubelet_socket).await?;
            let mut client = RegistrationClient::new(channel);
            client
                .register(Request::new(request))
                .await
                .map_err(|e| anyhow::anyhow!("registration failed: {e}"))
        };

        tokio::time::timeout(REGISTER_TIMEOUT, registration)
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "timed out after {REGISTER_TIMEOUT:?} registering with {}",
                    kubelet_socket.display()
                )
            })??;

        self.state = PluginState::Registered;
        Ok(())
    }

    /// Stop serving, release ListAndWatch callers and remove the socket.
    ///
    /// Stopping a stopped server does nothing.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        if self.state == PluginState::Stopped {
            return Ok(());
        }
        info!("Stopping server with socket {}", self.socket.display());

        self.stop.cancel();
        if let Some(mut server) = self.server.take() {
            match tokio::time::timeout(STOP_TIMEOUT, &mut server).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("gRPC server on {} failed: {e}", self.socket.display()),
                Ok(Err(e)) => warn!("gRPC server task on {} failed: {e}", self.socket.display()),
                Err(_) => {
                    warn!(
                        "gRPC server on {} did not drain within {STOP_TIMEOUT:?}, aborting",
                        self.socket.display()
                    );
                    server.abort();
                }
            }
        }
        self.state = PluginState::Stopped;
        info!("Server stopped with socket {}", self.socket.display());

        remove_socket(&self.socket)
    }

    async fn stop_quietly(&mut self) {
        if let Err(e) = self.stop().await {
            warn!("Failed to stop device plugin {}: {e:#}", self.resource_name);
        }
    }
}

impl Drop for VfioDevicePlugin {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: false,
    }
}

/// Remove a socket file, a missing file is fine.
fn remove_socket(socket: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(socket) {
        Ok(()) => {
            info!("Removing file {}", socket.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", socket.display())),
    }
}

/// create Unix Domain Socket client connection
pub async fn connect_uds(socket_path: &Path) -> anyhow::Result<Channel> {
    let socket_path = socket_path.to_path_buf();

    // The HTTP URL is a placeholder since we're using Unix socket connector
    let channel = Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await?;

    Ok(channel)
}

/// DevicePlugin service implementation for one device
#[derive(Debug)]
pub struct DevicePluginService {
    resource_name: String,
    pci_address: String,
    /// advertised list, a single healthy device named after the IOMMU group
    devices: Vec<Device>,
    stop: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        resource_name: String,
        pci_address: String,
        iommu_group: String,
        stop: CancellationToken,
    ) -> Self {
        let devices = vec![Device {
            id: iommu_group,
            health: device_plugin_pb::HEALTHY.to_string(),
            topology: None,
        }];

        Self {
            resource_name,
            pci_address,
            devices,
            stop,
        }
    }

    /// Device nodes and sysfs entries a container needs for one IOMMU group.
    fn device_specs(&self, iommu_group: &str) -> Vec<DeviceSpec> {
        let pci = &self.pci_address;
        [
            "/dev/vfio/vfio".to_string(),
            format!("/dev/vfio/{iommu_group}"),
            format!("/sys/bus/pci/devices/{pci}"),
            format!("/sys/bus/pci/drivers/vfio-pci/{pci}"),
            format!("/sys/kernel/iommu_groups/{iommu_group}"),
            naming::pci_domain_path(pci),
        ]
        .into_iter()
        .map(|path| DeviceSpec {
            container_path: path.clone(),
            host_path: path,
            permissions: PERMISSIONS.to_string(),
        })
        .collect()
    }

    fn envs(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                naming::env_key_strict(&self.resource_name),
                self.pci_address.clone(),
            ),
            (
                naming::env_key_lenient(&self.resource_name),
                self.pci_address.clone(),
            ),
        ])
    }
}

/// Push the device list once, then hold the stream until the plugin stops or
/// the caller hangs up.
async fn watch_devices(
    tx: mpsc::UnboundedSender<Result<ListAndWatchResponse, Status>>,
    response: ListAndWatchResponse,
    stop: CancellationToken,
    resource_name: String,
) {
    if tx.send(Ok(response)).is_err() {
        debug!("ListAndWatch receiver for {resource_name} went away");
        return;
    }
    tokio::select! {
        _ = stop.cancelled() => info!("device watch for {resource_name} stopped"),
        _ = tx.closed() => debug!("ListAndWatch caller for {resource_name} hung up"),
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(plugin_options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Send the device list once, then hold the stream open until stop.
    /// Health is not re-reported.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list for {}", self.resource_name);

        let (tx, rx) = mpsc::unbounded_channel::<Result<ListAndWatchResponse, Status>>();
        let stop = self.stop.clone();
        let response = ListAndWatchResponse {
            devices: self.devices.clone(),
        };
        let resource_name = self.resource_name.clone();

        tokio::spawn(watch_devices(tx, response, stop, resource_name));

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        debug!("getting preferred device allocation: {:?}", request.into_inner());
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();

        let container_responses = req
            .container_requests
            .into_iter()
            .map(|container_req| {
                let devices = container_req
                    .devices_ids
                    .iter()
                    .flat_map(|id| {
                        info!("Allocating IOMMU Group {id} ({})", self.pci_address);
                        self.device_specs(id)
                    })
                    .collect();

                ContainerAllocateResponse {
                    envs: self.envs(),
                    mounts: Vec::new(),
                    devices,
                    annotations: HashMap::new(),
                    cdi_devices: Vec::new(),
                }
            })
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
