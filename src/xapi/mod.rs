//! Typed access to the hypervisor management API.
//!
//! The API itself is an external collaborator: only the handful of fields
//! and calls the backup engine consumes are modeled as record types, and
//! everything else stays an opaque string. Calls go over XML-RPC (see
//! [`rpc`]).

pub mod rpc;

use std::thread;
use std::time::Duration;

use log::{debug, warn};
use reqwest::blocking::Client as HttpClient;

use crate::error::{Error, Result};
use rpc::Value;

const API_VERSION: &str = "1.0";
const ORIGINATOR: &str = "cbt-backup";
const NULL_REF: &str = "OpaqueRef:NULL";

macro_rules! opaque_ref {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl $name {
            /// Whether this is the NULL reference.
            pub fn is_null(&self) -> bool {
                self.0 == NULL_REF
            }
        }
    };
}

opaque_ref!(
    /// Opaque reference to a virtual machine.
    VmRef
);
opaque_ref!(
    /// Opaque reference to a virtual disk image.
    VdiRef
);
opaque_ref!(
    /// Opaque reference to a virtual block device.
    VbdRef
);
opaque_ref!(
    /// Opaque reference to a host.
    HostRef
);
opaque_ref!(
    /// Opaque reference to a storage repository.
    SrRef
);
opaque_ref!(
    /// Opaque reference to an asynchronous task.
    TaskRef
);

/// One NBD endpoint through which a VDI can be reached. Only valid while
/// the VDI remains attachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdInfo {
    pub address: String,
    pub port: u16,
    pub exportname: String,
    /// Expected TLS server name; may be empty.
    pub subject: String,
    /// PEM CA bundle for the NBD server certificate; may be empty.
    pub cert: String,
}

impl NbdInfo {
    fn from_value(value: &Value) -> Result<Self> {
        let field_text = |name: &str| -> Result<String> {
            value.expect_field(name).and_then(Value::expect_text)
        };
        let port = match value.expect_field("port")? {
            Value::Int(i) => *i as u16,
            other => other
                .expect_text()?
                .parse()
                .map_err(|_| Error::Api("invalid NBD port".to_string()))?,
        };
        Ok(Self {
            address: field_text("address")?,
            port,
            exportname: field_text("exportname")?,
            subject: field_text("subject").unwrap_or_default(),
            cert: field_text("cert").unwrap_or_default(),
        })
    }
}

/// An authenticated management-API session against the pool master.
pub struct Session {
    http: HttpClient,
    url: String,
    session_id: String,
}

impl Session {
    /// Log in with a username and password.
    pub fn login(master_address: &str, username: &str, password: &str) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| Error::Api(format!("building HTTP client: {err}")))?;
        let mut session = Self {
            http,
            url: format!("http://{master_address}"),
            session_id: String::new(),
        };
        let reply = session.rpc(
            "session.login_with_password",
            &[
                username.into(),
                password.into(),
                API_VERSION.into(),
                ORIGINATOR.into(),
            ],
        )?;
        session.session_id = reply.expect_text()?;
        Ok(session)
    }

    /// End the session. Best effort; the server expires sessions anyway.
    pub fn logout(&self) {
        if let Err(err) = self.call("session.logout", &[]) {
            warn!("logout failed: {err}");
        }
    }

    /// The pool master address this session was opened against.
    pub fn master_address(&self) -> &str {
        self.url.trim_start_matches("http://")
    }

    /// The session identifier, as used in HTTP query strings.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// A raw call without the implicit session parameter.
    fn rpc(&self, method: &str, params: &[Value]) -> Result<Value> {
        debug!(target: "xapi", "{method}");
        let body = rpc::encode_call(method, params);
        let response = self
            .http
            .post(&self.url)
            .header("content-type", "text/xml")
            .body(body)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|err| Error::Api(format!("{method} failed: {err}")))?;
        let text = response
            .text()
            .map_err(|err| Error::Api(format!("{method} failed: {err}")))?;
        let envelope = rpc::parse_response(&text)?;
        let status = envelope.expect_field("Status")?.expect_text()?;
        if status == "Success" {
            return Ok(envelope.expect_field("Value")?.clone());
        }
        let detail = envelope
            .field("ErrorDescription")
            .and_then(|v| v.expect_array().ok())
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::text)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_else(|| "unknown error".to_string());
        Err(Error::Api(format!("{method}: {detail}")))
    }

    /// A call with the session id as the implicit first parameter.
    fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        let mut full: Vec<Value> = Vec::with_capacity(params.len() + 1);
        full.push(self.session_id.as_str().into());
        full.extend(params.iter().cloned());
        self.rpc(method, &full)
    }

    // ----- session -----

    /// The host this session is served by (the pool master).
    pub fn this_host(&self) -> Result<HostRef> {
        self.call("session.get_this_host", &[self.session_id.as_str().into()])
            .and_then(|v| v.expect_text())
            .map(HostRef)
    }

    // ----- VM -----

    pub fn vm_by_uuid(&self, uuid: &str) -> Result<VmRef> {
        self.call("VM.get_by_uuid", &[uuid.into()])
            .and_then(|v| v.expect_text())
            .map(VmRef)
    }

    pub fn vm_uuid(&self, vm: &VmRef) -> Result<String> {
        self.call("VM.get_uuid", &[vm.0.as_str().into()])
            .and_then(|v| v.expect_text())
    }

    pub fn vm_name_label(&self, vm: &VmRef) -> Result<String> {
        self.call("VM.get_name_label", &[vm.0.as_str().into()])
            .and_then(|v| v.expect_text())
    }

    /// Snapshot the VM under the given name, returning the snapshot VM.
    pub fn vm_snapshot(&self, vm: &VmRef, name: &str) -> Result<VmRef> {
        self.call("VM.snapshot", &[vm.0.as_str().into(), name.into()])
            .and_then(|v| v.expect_text())
            .map(VmRef)
    }

    pub fn vm_vbds(&self, vm: &VmRef) -> Result<Vec<VbdRef>> {
        let value = self.call("VM.get_VBDs", &[vm.0.as_str().into()])?;
        let refs = value.expect_array()?;
        refs.iter()
            .map(|v| v.expect_text().map(VbdRef))
            .collect()
    }

    pub fn vm_destroy(&self, vm: &VmRef) -> Result<()> {
        self.call("VM.destroy", &[vm.0.as_str().into()]).map(|_| ())
    }

    // ----- VBD -----

    pub fn vbd_vdi(&self, vbd: &VbdRef) -> Result<VdiRef> {
        self.call("VBD.get_VDI", &[vbd.0.as_str().into()])
            .and_then(|v| v.expect_text())
            .map(VdiRef)
    }

    pub fn vbd_empty(&self, vbd: &VbdRef) -> Result<bool> {
        self.call("VBD.get_empty", &[vbd.0.as_str().into()])
            .and_then(|v| v.expect_bool())
    }

    // ----- VDI -----

    pub fn vdi_by_uuid(&self, uuid: &str) -> Result<VdiRef> {
        self.call("VDI.get_by_uuid", &[uuid.into()])
            .and_then(|v| v.expect_text())
            .map(VdiRef)
    }

    pub fn vdi_uuid(&self, vdi: &VdiRef) -> Result<String> {
        self.call("VDI.get_uuid", &[vdi.0.as_str().into()])
            .and_then(|v| v.expect_text())
    }

    pub fn vdi_cbt_enabled(&self, vdi: &VdiRef) -> Result<bool> {
        self.call("VDI.get_cbt_enabled", &[vdi.0.as_str().into()])
            .and_then(|v| v.expect_bool())
    }

    pub fn vdi_enable_cbt(&self, vdi: &VdiRef) -> Result<()> {
        self.call("VDI.enable_cbt", &[vdi.0.as_str().into()])
            .map(|_| ())
    }

    /// Snapshot a single VDI, returning the snapshot VDI.
    pub fn vdi_snapshot(&self, vdi: &VdiRef) -> Result<VdiRef> {
        self.call("VDI.snapshot", &[vdi.0.as_str().into(), Value::Struct(vec![])])
            .and_then(|v| v.expect_text())
            .map(VdiRef)
    }

    /// The live VDI this snapshot was taken of (NULL for a live VDI).
    pub fn vdi_snapshot_of(&self, vdi: &VdiRef) -> Result<VdiRef> {
        self.call("VDI.get_snapshot_of", &[vdi.0.as_str().into()])
            .and_then(|v| v.expect_text())
            .map(VdiRef)
    }

    /// The snapshots of a live VDI. Empty when called on a snapshot; chain
    /// navigation must route through the live VDI.
    pub fn vdi_snapshots(&self, vdi: &VdiRef) -> Result<Vec<VdiRef>> {
        let value = self.call("VDI.get_snapshots", &[vdi.0.as_str().into()])?;
        value
            .expect_array()?
            .iter()
            .map(|v| v.expect_text().map(VdiRef))
            .collect()
    }

    /// Snapshot time as an ISO-8601 string; lexicographic order is
    /// chronological order.
    pub fn vdi_snapshot_time(&self, vdi: &VdiRef) -> Result<String> {
        self.call("VDI.get_snapshot_time", &[vdi.0.as_str().into()])
            .and_then(|v| v.expect_text())
    }

    pub fn vdi_virtual_size(&self, vdi: &VdiRef) -> Result<u64> {
        let value = self.call("VDI.get_virtual_size", &[vdi.0.as_str().into()])?;
        match value {
            Value::Int(i) => Ok(i as u64),
            other => other
                .expect_text()?
                .parse()
                .map_err(|_| Error::Api("invalid virtual_size".to_string())),
        }
    }

    /// The base64-encoded bitmap of blocks that changed between two
    /// snapshots of the same VDI.
    pub fn vdi_list_changed_blocks(&self, from: &VdiRef, to: &VdiRef) -> Result<String> {
        self.call(
            "VDI.list_changed_blocks",
            &[from.0.as_str().into(), to.0.as_str().into()],
        )
        .and_then(|v| v.expect_text())
    }

    /// NBD endpoints through which this VDI can currently be reached.
    pub fn vdi_nbd_info(&self, vdi: &VdiRef) -> Result<Vec<NbdInfo>> {
        let value = self.call("VDI.get_nbd_info", &[vdi.0.as_str().into()])?;
        value
            .expect_array()?
            .iter()
            .map(NbdInfo::from_value)
            .collect()
    }

    /// Reduce a snapshot to CBT metadata, deleting its data.
    pub fn vdi_data_destroy(&self, vdi: &VdiRef) -> Result<()> {
        self.call("VDI.data_destroy", &[vdi.0.as_str().into()])
            .map(|_| ())
    }

    pub fn vdi_destroy(&self, vdi: &VdiRef) -> Result<()> {
        self.call("VDI.destroy", &[vdi.0.as_str().into()])
            .map(|_| ())
    }

    /// Create a blank user VDI of the given size on the given SR.
    pub fn vdi_create(&self, sr: &SrRef, virtual_size: u64, name_label: &str) -> Result<VdiRef> {
        let record = Value::Struct(vec![
            ("SR".to_string(), sr.0.as_str().into()),
            ("virtual_size".to_string(), virtual_size.to_string().into()),
            ("type".to_string(), "user".into()),
            ("sharable".to_string(), Value::Bool(false)),
            ("read_only".to_string(), Value::Bool(false)),
            ("other_config".to_string(), Value::Struct(vec![])),
            ("name_label".to_string(), name_label.into()),
            ("name_description".to_string(), "".into()),
        ]);
        self.call("VDI.create", &[record])
            .and_then(|v| v.expect_text())
            .map(VdiRef)
    }

    /// Start a server-side checksum of the VDI; the result arrives through
    /// the returned task.
    pub fn async_vdi_checksum(&self, vdi: &VdiRef) -> Result<TaskRef> {
        self.call("Async.VDI.checksum", &[vdi.0.as_str().into()])
            .and_then(|v| v.expect_text())
            .map(TaskRef)
    }

    // ----- SR -----

    pub fn sr_by_uuid(&self, uuid: &str) -> Result<SrRef> {
        self.call("SR.get_by_uuid", &[uuid.into()])
            .and_then(|v| v.expect_text())
            .map(SrRef)
    }

    // ----- host -----

    pub fn host_by_uuid(&self, uuid: &str) -> Result<HostRef> {
        self.call("host.get_by_uuid", &[uuid.into()])
            .and_then(|v| v.expect_text())
            .map(HostRef)
    }

    pub fn host_address(&self, host: &HostRef) -> Result<String> {
        self.call("host.get_address", &[host.0.as_str().into()])
            .and_then(|v| v.expect_text())
    }

    pub fn host_hostname(&self, host: &HostRef) -> Result<String> {
        self.call("host.get_hostname", &[host.0.as_str().into()])
            .and_then(|v| v.expect_text())
    }

    /// The host's TLS certificate in PEM form.
    pub fn host_server_certificate(&self, host: &HostRef) -> Result<String> {
        self.call("host.get_server_certificate", &[host.0.as_str().into()])
            .and_then(|v| v.expect_text())
    }

    // ----- tasks -----

    pub fn task_create(&self, label: &str, description: &str) -> Result<TaskRef> {
        self.call("task.create", &[label.into(), description.into()])
            .and_then(|v| v.expect_text())
            .map(TaskRef)
    }

    pub fn task_status(&self, task: &TaskRef) -> Result<String> {
        self.call("task.get_status", &[task.0.as_str().into()])
            .and_then(|v| v.expect_text())
    }

    /// The XML result document of a finished task.
    pub fn task_result(&self, task: &TaskRef) -> Result<String> {
        self.call("task.get_result", &[task.0.as_str().into()])
            .and_then(|v| v.expect_text())
    }

    pub fn task_error_info(&self, task: &TaskRef) -> Result<Vec<String>> {
        let value = self.call("task.get_error_info", &[task.0.as_str().into()])?;
        value
            .expect_array()?
            .iter()
            .map(Value::expect_text)
            .collect()
    }

    pub fn task_destroy(&self, task: &TaskRef) -> Result<()> {
        self.call("task.destroy", &[task.0.as_str().into()])
            .map(|_| ())
    }

    // ----- host HTTP endpoints -----

    /// An HTTP client plus base URL for talking to a host's HTTP handlers
    /// (`/export_metadata`, `/import_metadata`, `/import_raw_vdi`).
    ///
    /// With TLS the host's advertised certificate is pinned and hostname
    /// verification binds to the host's advertised hostname, which may
    /// differ from the address the connection actually dials.
    pub fn host_http(&self, host: &HostRef, use_tls: bool) -> Result<(HttpClient, String)> {
        let address = self.host_address(host)?;
        if !use_tls {
            let client = HttpClient::builder()
                .build()
                .map_err(|err| Error::Api(format!("building HTTP client: {err}")))?;
            return Ok((client, format!("http://{address}")));
        }
        let cert = self.host_server_certificate(host)?;
        let hostname = self.host_hostname(host)?;
        let pinned = reqwest::Certificate::from_pem(cert.as_bytes())
            .map_err(|err| Error::Api(format!("unusable host certificate: {err}")))?;
        let mut builder = HttpClient::builder().add_root_certificate(pinned);
        if let Ok(ip) = address.parse::<std::net::IpAddr>() {
            builder = builder.resolve(&hostname, std::net::SocketAddr::new(ip, 443));
        }
        let client = builder
            .build()
            .map_err(|err| Error::Api(format!("building HTTPS client: {err}")))?;
        Ok((client, format!("https://{hostname}")))
    }

    // ----- task polling -----

    /// Poll a task to completion, discarding its result document.
    pub fn wait_task(&self, task: &TaskRef) -> Result<()> {
        self.wait_task_raw(task).map(|_| ())
    }

    /// Poll a task to completion and extract the text of the single
    /// `<value>` element of its result document.
    pub fn wait_task_result(&self, task: &TaskRef) -> Result<String> {
        let result = self.wait_task_raw(task)?;
        rpc::value_text(&result)
    }

    fn wait_task_raw(&self, task: &TaskRef) -> Result<String> {
        let result = loop {
            match self.task_status(task)?.as_str() {
                "pending" => thread::sleep(Duration::from_millis(500)),
                "success" => break self.task_result(task)?,
                status => {
                    let info = self
                        .task_error_info(task)
                        .unwrap_or_default()
                        .join(", ");
                    let _ = self.task_destroy(task);
                    return Err(Error::Api(format!("task ended as {status}: {info}")));
                }
            }
        };
        let _ = self.task_destroy(task);
        Ok(result)
    }
}
