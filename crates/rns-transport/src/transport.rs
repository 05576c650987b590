//! The router: the single logically serialized component surrounded by
//! interface I/O. One mutex-guarded router struct, registered interfaces,
//! periodic maintenance, and the generic [`crate::iface::InterfaceAdapter`]
//! trait in place of any concrete physical interface set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use rand_core::OsRng;
use tokio::sync::{broadcast, Mutex};

use rns_core::destination::{validate_announce_packet, DestinationKind, LocalDestination};
use rns_core::hash::AddressHash;
use rns_core::identity::{Identity, PrivateIdentity};
use rns_core::packet::{
    DestinationType, Flags, HeaderType, Packet, PacketContext, PacketType, PropagationType,
};

use crate::announce_queue::{AnnounceQueue, AnnounceQueueEntry};
use crate::config::TransportConfig;
use crate::dedup::DedupRing;
use crate::error::TransportError;
use crate::iface::InterfaceAdapter;
use crate::link::{CloseReason, KeepaliveAction, Link, LinkMode};
use crate::path_table::{PathEntry, PathTable, ReverseEntry, ReverseTable};
use crate::process::{KnownDestination, Lifecycle, Store};
use crate::receipt::{ReceiptOutcome, ReceiptTable};
use crate::resource::{self, Advertisement, TransferMode};

/// Delivered once to an embedder after a DATA packet reaches a local
/// destination: at most once, regardless of how many interfaces delivered
/// the underlying packet.
pub type PacketCallback = Arc<dyn Fn(AddressHash, Vec<u8>) + Send + Sync>;
/// Delivered once a link attached to a destination reaches ACTIVE.
pub type LinkEstablishedCallback = Arc<dyn Fn(AddressHash) + Send + Sync>;
/// Delivered exactly once when a link leaves the link table, whatever the
/// cause: remote LINKCLOSE, local teardown, or a keepalive timeout.
pub type LinkClosedCallback = Arc<dyn Fn(AddressHash, CloseReason) + Send + Sync>;

struct DestinationEntry {
    destination: LocalDestination,
    remote_identities: HashMap<AddressHash, Identity>,
    packet_callback: Option<PacketCallback>,
    link_established_callback: Option<LinkEstablishedCallback>,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

struct Inner {
    config: TransportConfig,
    transport_identity: PrivateIdentity,
    transport_id: AddressHash,
    interfaces: HashMap<String, Arc<dyn InterfaceAdapter>>,
    path_table: PathTable,
    reverse_table: ReverseTable,
    dedup: DedupRing,
    announce_queue: AnnounceQueue,
    receipts: ReceiptTable,
    destinations: HashMap<AddressHash, DestinationEntry>,
    links: HashMap<AddressHash, Link>,
    link_closed_callbacks: HashMap<AddressHash, LinkClosedCallback>,
    known_destinations: HashMap<AddressHash, KnownDestination>,
    store: Store,
    lifecycle: Lifecycle,
}

/// The router, shared behind an `Arc` and a single mutex: every mutation of
/// the path table, reverse table, dedup ring, link table and receipt table
/// happens while this lock is held.
pub struct Transport {
    inner: Arc<Mutex<Inner>>,
    receipt_events: broadcast::Sender<(AddressHash, ReceiptOutcome)>,
    transport_id: AddressHash,
}

impl Transport {
    pub fn new(config: TransportConfig, transport_identity: PrivateIdentity) -> Self {
        let transport_id = transport_identity.hash();
        let store = Store::new(
            config.known_destinations_path.clone(),
            config.ratchet_store_dir.clone(),
        );
        let path_ttl = Duration::from_secs(config.path_ttl_secs);
        let inner = Inner {
            dedup: DedupRing::new(config.dedup_ring_capacity),
            announce_queue: AnnounceQueue::new(
                4096,
                config.announce_bandwidth_budget_pct,
                config.announce_burst_multiplier,
            ),
            receipts: ReceiptTable::new(),
            path_table: PathTable::new(path_ttl),
            reverse_table: ReverseTable::new(Duration::from_secs(60)),
            destinations: HashMap::new(),
            links: HashMap::new(),
            link_closed_callbacks: HashMap::new(),
            known_destinations: HashMap::new(),
            interfaces: HashMap::new(),
            store,
            lifecycle: Lifecycle::new(),
            config,
            transport_identity,
            transport_id,
        };
        let (receipt_events, _) = broadcast::channel(1024);
        Self { inner: Arc::new(Mutex::new(inner)), receipt_events, transport_id }
    }

    pub fn transport_id(&self) -> AddressHash {
        self.transport_id
    }

    /// Whether the router currently has a cached path to `destination_hash`.
    pub async fn has_path(&self, destination_hash: AddressHash) -> bool {
        let inner = self.inner.lock().await;
        inner.path_table.get(&destination_hash).is_some()
    }

    pub async fn start(&self) -> Result<(), crate::error::LifecycleError> {
        let mut inner = self.inner.lock().await;
        let known = inner.store.load_known_destinations();
        info!("transport starting with {} known destinations loaded", known.len());
        inner.known_destinations = known;
        inner.lifecycle.start()
    }

    /// Cancels all timers, fires `Failed` on every outstanding receipt, and
    /// transitions every link to `CLOSED(LocalTeardown)`.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for hash in inner.receipts.cancel_all() {
            let _ = self.receipt_events.send((hash, ReceiptOutcome::Failed));
        }
        let link_ids: Vec<AddressHash> = inner.links.keys().copied().collect();
        for link_id in link_ids {
            self.teardown_link(&mut inner, link_id, CloseReason::LocalTeardown);
        }
    }

    /// Registers a callback fired exactly once when `link_id` leaves the
    /// link table, whatever the reason.
    pub async fn set_link_closed_callback(&self, link_id: AddressHash, callback: LinkClosedCallback) {
        let mut inner = self.inner.lock().await;
        inner.link_closed_callbacks.insert(link_id, callback);
    }

    /// Removes `link_id` from the link table, marks it closed with
    /// `reason`, and fires its registered [`LinkClosedCallback`], if any.
    fn teardown_link(&self, inner: &mut Inner, link_id: AddressHash, reason: CloseReason) {
        if let Some(mut link) = inner.links.remove(&link_id) {
            link.close(reason);
            info!("link {link_id} closed: {reason:?}");
        }
        if let Some(cb) = inner.link_closed_callbacks.remove(&link_id) {
            cb(link_id, reason);
        }
    }

    pub fn subscribe_receipts(&self) -> broadcast::Receiver<(AddressHash, ReceiptOutcome)> {
        self.receipt_events.subscribe()
    }

    pub async fn register_interface(&self, iface: Arc<dyn InterfaceAdapter>) {
        let mut inner = self.inner.lock().await;
        inner.interfaces.insert(iface.id().to_string(), iface);
    }

    pub async fn register_destination(
        &self,
        destination: LocalDestination,
        packet_callback: Option<PacketCallback>,
        link_established_callback: Option<LinkEstablishedCallback>,
    ) {
        let hash = destination.hash;
        let mut inner = self.inner.lock().await;
        inner.destinations.insert(
            hash,
            DestinationEntry {
                destination,
                remote_identities: HashMap::new(),
                packet_callback,
                link_established_callback,
            },
        );
    }

    /// Builds and broadcasts an ANNOUNCE for a registered local destination
    /// on every online interface.
    pub async fn send_announce(
        &self,
        destination_hash: AddressHash,
        app_data: Option<Vec<u8>>,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let mut rng = OsRng;
        let packet = {
            let entry = inner
                .destinations
                .get(&destination_hash)
                .ok_or(TransportError::PathExpired)?;
            let ratchet = entry.destination.ratchets.newest().map(|r| r.public_key);
            entry.destination.announce(&mut rng, app_data.as_deref(), ratchet)
        };
        let bytes = packet.to_bytes();
        let arrival = now_secs();
        let interface_ids: Vec<String> = inner.interfaces.keys().cloned().collect();
        for id in interface_ids {
            inner.announce_queue.enqueue(
                &id,
                AnnounceQueueEntry {
                    destination_hash,
                    packet_bytes: bytes.clone(),
                    received_on_interface: None,
                    arrival_timestamp: arrival,
                    hops: 0,
                },
            );
        }
        Ok(())
    }

    /// Broadcasts a path request (`PacketContext::CacheRequest`) for
    /// `destination_hash`: any router already holding a cached path
    /// re-announces it with context `PathResponse`; everyone else relays
    /// the request onward.
    pub async fn request_path(&self, destination_hash: AddressHash) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let packet = Packet {
            flags: Flags {
                header_type: HeaderType::Type1,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Data,
                context_flag: 0,
            },
            hops: 0,
            transport_id: None,
            destination: destination_hash,
            context: PacketContext::CacheRequest,
            payload: Vec::new(),
        };
        let interface_ids: Vec<String> = inner.interfaces.keys().cloned().collect();
        for id in &interface_ids {
            let _ = self.send_via(&mut inner, Some(id), &packet);
        }
        Ok(())
    }

    /// A cache request for a destination we have a cached path for is
    /// answered by re-announcing that path with its context overridden to
    /// `PathResponse`; otherwise the request is relayed onward, hop count
    /// incremented, on every other interface.
    fn handle_path_request(&self, inner: &mut Inner, interface_id: &str, packet: Packet) {
        if let Some(path) = inner.path_table.get(&packet.destination) {
            let Ok(mut response) = Packet::from_bytes(&path.latest_announce_packet_bytes) else {
                return;
            };
            response.context = PacketContext::PathResponse;
            let _ = self.send_via(inner, Some(interface_id), &response);
            return;
        }

        let mut forwarded = packet;
        forwarded.hops = forwarded.hops.saturating_add(1);
        let other_interfaces: Vec<String> =
            inner.interfaces.keys().filter(|id| id.as_str() != interface_id).cloned().collect();
        for id in other_interfaces {
            let _ = self.send_via(inner, Some(&id), &forwarded);
        }
    }

    /// Opens a link to `remote_destination`, looked up in the path table.
    /// Returns the `link_id` once the LINKREQUEST has been sent; the link
    /// reaches `Active` asynchronously when the LRPROOF arrives via
    /// [`Transport::handle_inbound`].
    pub async fn open_link(&self, remote_destination: AddressHash) -> Result<AddressHash, TransportError> {
        let mut inner = self.inner.lock().await;
        let (interface_id, mtu) = {
            let path = inner.path_table.get(&remote_destination).ok_or(TransportError::PathExpired)?;
            (path.next_hop_interface.clone(), 500u32)
        };
        let iface = inner
            .interfaces
            .get(&interface_id)
            .cloned()
            .ok_or_else(|| TransportError::InterfaceOffline(interface_id.clone()))?;
        if !iface.online() {
            return Err(TransportError::InterfaceOffline(interface_id));
        }

        let mut rng = OsRng;
        let (mut link, request_packet) =
            Link::initiate(&mut rng, remote_destination, mtu, LinkMode::Full, Instant::now());
        link.finish_initiate(&request_packet);
        let link_id = link.link_id;
        let bytes = request_packet.to_bytes();
        iface.send(&bytes);
        inner.links.insert(link_id, link);
        Ok(link_id)
    }

    pub async fn send_link_data(&self, link_id: AddressHash, plaintext: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let remote_destination = {
            let link = inner.links.get(&link_id).ok_or(TransportError::PathExpired)?;
            link.remote_destination()
        };
        let interface_id = inner
            .path_table
            .get(&remote_destination)
            .map(|p| p.next_hop_interface.clone());
        let mut rng = OsRng;
        let ciphertext = {
            let link = inner.links.get(&link_id).ok_or(TransportError::PathExpired)?;
            link.encrypt_data(&mut rng, plaintext)
        };
        let packet = Packet {
            flags: Flags {
                header_type: HeaderType::Type1,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                context_flag: 0,
            },
            hops: 0,
            transport_id: None,
            destination: link_id,
            context: PacketContext::None,
            payload: ciphertext,
        };
        self.send_via(&mut inner, interface_id.as_deref(), &packet)
    }

    /// Sends `plaintext` over `link_id`, choosing between a single DATA
    /// frame and the Resource protocol by comparing its length against the
    /// link's MDU.
    pub async fn send_link_payload(&self, link_id: AddressHash, plaintext: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let mdu = inner.links.get(&link_id).map(|l| l.mdu()).ok_or(TransportError::PathExpired)?;
        match resource::choose_transfer_mode(mdu, plaintext.len()) {
            TransferMode::Packet => {
                drop(inner);
                self.send_link_data(link_id, plaintext).await
            }
            TransferMode::Resource => {
                let max_size = inner.config.max_resource_size_bytes;
                let mut rng = OsRng;
                let advertisement = {
                    let link = inner.links.get_mut(&link_id).ok_or(TransportError::PathExpired)?;
                    link.begin_sending_resource(&mut rng, plaintext, max_size)
                        .map_err(|_| TransportError::PathExpired)?
                };
                let adv_bytes = advertisement.to_bytes();
                self.send_link_frame(&mut inner, link_id, PacketContext::ResourceAdv, &adv_bytes)
            }
        }
    }

    /// Encrypts `plaintext` with `link_id`'s token and sends it as a DATA
    /// frame carrying `context`, routed via the cached path to the link's
    /// remote destination.
    fn send_link_frame(
        &self,
        inner: &mut Inner,
        link_id: AddressHash,
        context: PacketContext,
        plaintext: &[u8],
    ) -> Result<(), TransportError> {
        let remote_destination =
            inner.links.get(&link_id).map(|l| l.remote_destination()).ok_or(TransportError::PathExpired)?;
        let interface_id = inner.path_table.get(&remote_destination).map(|p| p.next_hop_interface.clone());
        let mut rng = OsRng;
        let ciphertext = {
            let link = inner.links.get(&link_id).ok_or(TransportError::PathExpired)?;
            link.encrypt_data(&mut rng, plaintext)
        };
        let packet = Packet {
            flags: Flags {
                header_type: HeaderType::Type1,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                context_flag: 0,
            },
            hops: 0,
            transport_id: None,
            destination: link_id,
            context,
            payload: ciphertext,
        };
        self.send_via(inner, interface_id.as_deref(), &packet)
    }

    /// Dispatches an inbound ADV/REQ/PART/PROOF frame for the Resource
    /// protocol layered over `link_id`.
    fn handle_resource_frame(
        &self,
        inner: &mut Inner,
        link_id: AddressHash,
        context: PacketContext,
        ciphertext: &[u8],
    ) {
        let plaintext = match inner.links.get_mut(&link_id) {
            Some(link) => match link.decrypt_data(ciphertext, Instant::now()) {
                Ok(p) => p,
                Err(e) => {
                    debug!("dropping undecryptable resource frame on link {link_id}: {e}");
                    return;
                }
            },
            None => {
                debug!("resource frame for unknown link {link_id}");
                return;
            }
        };

        match context {
            PacketContext::ResourceAdv => {
                let Some(advertisement) = Advertisement::from_bytes(&plaintext) else {
                    debug!("malformed resource advertisement on link {link_id}");
                    return;
                };
                let max_size = inner.config.max_resource_size_bytes;
                let missing = match inner.links.get_mut(&link_id) {
                    Some(link) => match link.begin_receiving_resource(advertisement, max_size) {
                        Ok(missing) => missing,
                        Err(e) => {
                            debug!("rejecting resource advertisement on link {link_id}: {e}");
                            return;
                        }
                    },
                    None => return,
                };
                let req = resource::encode_req(&missing);
                let _ = self.send_link_frame(inner, link_id, PacketContext::ResourceReq, &req);
            }
            PacketContext::ResourceReq => {
                let wanted = resource::decode_req(&plaintext);
                let frames = match inner.links.get_mut(&link_id) {
                    Some(link) => link.resource_parts_for(&wanted),
                    None => None,
                };
                let Some(frames) = frames else {
                    debug!("resource request for link {link_id} with no outbound transfer");
                    return;
                };
                for frame in frames {
                    let _ = self.send_link_frame(inner, link_id, PacketContext::Resource, &frame);
                }
            }
            PacketContext::Resource => {
                let ingested = match inner.links.get_mut(&link_id) {
                    Some(link) => link.ingest_resource_part(&plaintext),
                    None => return,
                };
                match ingested {
                    Ok(Some(missing)) => {
                        let req = resource::encode_req(&missing);
                        let _ = self.send_link_frame(inner, link_id, PacketContext::ResourceReq, &req);
                    }
                    Ok(None) => {
                        let concluded = match inner.links.get_mut(&link_id) {
                            Some(link) => link.conclude_resource(),
                            None => return,
                        };
                        let Ok((assembled, proof)) = concluded else {
                            debug!("resource transfer on link {link_id} failed to assemble");
                            return;
                        };
                        let remote_destination = inner.links.get(&link_id).map(|l| l.remote_destination());
                        let attached = inner.links.get(&link_id).and_then(|l| l.attached_destination);
                        let target = attached.or(remote_destination);
                        if let Some(target) = target {
                            if let Some(entry) = inner.destinations.get(&target) {
                                if let Some(cb) = &entry.packet_callback {
                                    cb(link_id, assembled);
                                }
                            }
                        }
                        info!("resource transfer on link {link_id} completed ({} bytes)", assembled.len());
                        let _ =
                            self.send_link_frame(inner, link_id, PacketContext::ResourceProof, &proof);
                    }
                    Err(e) => debug!("dropping malformed resource part on link {link_id}: {e}"),
                }
            }
            PacketContext::ResourceProof => {
                let verified = match inner.links.get_mut(&link_id) {
                    Some(link) => link.verify_resource_proof(&plaintext),
                    None => return,
                };
                match verified {
                    Ok(()) => {
                        let _ = self.receipt_events.send((link_id, ReceiptOutcome::Delivered));
                    }
                    Err(e) => debug!("resource proof on link {link_id} did not verify: {e}"),
                }
            }
            _ => {}
        }
    }

    /// Tears down `link_id` locally and signals the peer with a
    /// `PacketContext::LinkClose` frame before removing it.
    pub async fn close_link(&self, link_id: AddressHash) {
        let mut inner = self.inner.lock().await;
        let remote_destination = inner.links.get(&link_id).map(|l| l.remote_destination());
        let interface_id = remote_destination
            .and_then(|d| inner.path_table.get(&d))
            .map(|p| p.next_hop_interface.clone());
        let close_packet = Packet {
            flags: Flags {
                header_type: HeaderType::Type1,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                context_flag: 0,
            },
            hops: 0,
            transport_id: None,
            destination: link_id,
            context: PacketContext::LinkClose,
            payload: Vec::new(),
        };
        let _ = self.send_via(&mut inner, interface_id.as_deref(), &close_packet);
        self.teardown_link(&mut inner, link_id, CloseReason::LocalTeardown);
    }

    fn send_via(
        &self,
        inner: &mut Inner,
        interface_id: Option<&str>,
        packet: &Packet,
    ) -> Result<(), TransportError> {
        let Some(interface_id) = interface_id else {
            return Err(TransportError::PathExpired);
        };
        let iface = inner
            .interfaces
            .get(interface_id)
            .ok_or_else(|| TransportError::InterfaceOffline(interface_id.to_string()))?;
        if !iface.online() {
            return Err(TransportError::InterfaceOffline(interface_id.to_string()));
        }
        let bytes = packet.to_bytes();
        let bytes = match iface.ifac() {
            Some(ifac) => ifac.mask(&bytes),
            None => bytes,
        };
        iface.send(&bytes);
        Ok(())
    }

    /// The ingress pipeline: IFAC demask, parse, dedup, dispatch.
    pub async fn handle_inbound(&self, interface_id: &str, raw: &[u8]) {
        let mut inner = self.inner.lock().await;
        let Some(iface) = inner.interfaces.get(interface_id).cloned() else {
            warn!("inbound bytes on unregistered interface {interface_id}");
            return;
        };
        let demasked = match iface.ifac() {
            Some(ifac) => match ifac.unmask(raw) {
                Some(bytes) => bytes,
                None => {
                    debug!("dropping frame with invalid IFAC tag on {interface_id}");
                    return;
                }
            },
            None => raw.to_vec(),
        };

        let packet = match Packet::from_bytes(&demasked) {
            Ok(p) => p,
            Err(e) => {
                debug!("dropping unparseable packet on {interface_id}: {e}");
                return;
            }
        };

        let full_hash = packet.hash();
        if inner.dedup.seen_or_insert(&full_hash, now_secs()) {
            debug!("dropping duplicate packet on {interface_id}");
            return;
        }

        match packet.flags.packet_type {
            PacketType::Announce => self.handle_announce(&mut inner, interface_id, packet).await,
            PacketType::LinkRequest => self.handle_link_request(&mut inner, interface_id, packet),
            PacketType::Proof => self.handle_proof(&mut inner, packet),
            PacketType::Data => self.handle_data(&mut inner, interface_id, packet),
        }
    }

    async fn handle_announce(&self, inner: &mut Inner, interface_id: &str, packet: Packet) {
        let info = match validate_announce_packet(&packet) {
            Ok(info) => info,
            Err(e) => {
                debug!("rejecting announce: {e}");
                return;
            }
        };

        let interface_bitrate =
            inner.interfaces.get(interface_id).map(|i| i.bitrate()).unwrap_or(0);
        let candidate = PathEntry {
            next_hop_interface: interface_id.to_string(),
            next_hop_transport_id: packet.transport_id,
            hops: packet.hops,
            expires_at: Instant::now() + inner.path_table.ttl(),
            latest_announce_packet_bytes: packet.to_bytes(),
            latest_announce_timestamp: now_secs(),
            public_key: info.public_key,
            interface_bitrate,
        };
        let accepted = inner.path_table.offer(info.destination_hash, candidate, Instant::now());
        if !accepted {
            return;
        }

        if let Some(entry) = inner.destinations.get_mut(&info.destination_hash) {
            if let Some(ratchet) = info.ratchet {
                entry.destination.ratchets.record(ratchet, now_secs());
            }
        }

        inner.known_destinations.insert(
            info.destination_hash,
            KnownDestination {
                timestamp_ms: now_secs() as i64 * 1000,
                packet_hash: packet.hash().as_bytes().to_vec(),
                public_key: info.public_key.to_vec(),
                app_data: if info.app_data.is_empty() { None } else { Some(info.app_data.clone()) },
            },
        );

        // Re-propagate on every other online interface: hop count
        // incremented, header upgraded to variant 2 carrying our transport
        // id (see DESIGN.md: hop count stays unchanged only for
        // local-client forwarding, not for this general-propagation path).
        let mut forwarded = packet;
        forwarded.hops = forwarded.hops.saturating_add(1);
        forwarded.flags.header_type = HeaderType::Type2;
        forwarded.flags.propagation_type = PropagationType::Transport;
        forwarded.transport_id = Some(inner.transport_id);
        let bytes = forwarded.to_bytes();

        let other_interfaces: Vec<String> = inner
            .interfaces
            .keys()
            .filter(|id| id.as_str() != interface_id)
            .cloned()
            .collect();
        let arrival = now_secs();
        for id in other_interfaces {
            inner.announce_queue.enqueue(
                &id,
                AnnounceQueueEntry {
                    destination_hash: info.destination_hash,
                    packet_bytes: bytes.clone(),
                    received_on_interface: Some(interface_id.to_string()),
                    arrival_timestamp: arrival,
                    hops: forwarded.hops,
                },
            );
        }
    }

    fn handle_link_request(&self, inner: &mut Inner, interface_id: &str, packet: Packet) {
        let Some(entry) = inner.destinations.get(&packet.destination) else {
            debug!("link request for unknown local destination");
            return;
        };
        if entry.destination.kind != DestinationKind::Single {
            return;
        }
        let identity = entry.destination.identity.clone();
        let mut rng = OsRng;
        let (link, proof_packet) = match Link::respond(&mut rng, &packet, &identity, Instant::now()) {
            Ok(pair) => pair,
            Err(e) => {
                debug!("rejecting link request: {e}");
                return;
            }
        };
        if inner.links.contains_key(&link.link_id) {
            debug!("duplicate LRPROOF for already-active link {}", link.link_id);
            return;
        }

        inner.reverse_table.record(
            *packet.hash().as_bytes(),
            ReverseEntry {
                inbound_interface: interface_id.to_string(),
                outbound_interface: interface_id.to_string(),
                timestamp: Instant::now(),
            },
        );

        let link_id = link.link_id;
        inner.links.insert(link_id, link);
        let _ = self.send_via(inner, Some(interface_id), &proof_packet);

        if let Some(entry) = inner.destinations.get(&packet.destination) {
            if let Some(cb) = &entry.link_established_callback {
                cb(link_id);
            }
        }
    }

    fn handle_proof(&self, inner: &mut Inner, packet: Packet) {
        match packet.context {
            PacketContext::LinkRequestProof => {
                if let Some(link) = inner.links.get_mut(&packet.destination) {
                    // The initiator side needs the responder's identity to
                    // verify the embedded signature; it is carried in the
                    // LRPROOF payload itself.
                    if packet.payload.len() < 96 {
                        return;
                    }
                    let identity_pub: [u8; 64] = packet.payload[32..96].try_into().unwrap();
                    let Some(remote_identity) = Identity::from_public_bytes(&identity_pub) else {
                        return;
                    };
                    if link.handle_proof(&packet, &remote_identity, Instant::now()).is_ok() {
                        let remote_destination = link.remote_destination();
                        for entry in inner.destinations.values() {
                            if entry.destination.hash == remote_destination {
                                if let Some(cb) = &entry.link_established_callback {
                                    cb(packet.destination);
                                }
                            }
                        }
                    }
                }
            }
            PacketContext::LinkProof => {
                if inner.receipts.resolve_delivered(&packet.destination) {
                    let _ = self.receipt_events.send((packet.destination, ReceiptOutcome::Delivered));
                }
            }
            _ => {}
        }
    }

    fn handle_data(&self, inner: &mut Inner, interface_id: &str, packet: Packet) {
        if packet.context == PacketContext::CacheRequest {
            self.handle_path_request(inner, interface_id, packet);
            return;
        }

        if packet.flags.destination_type == DestinationType::Link {
            let link_id = packet.destination;

            if packet.context == PacketContext::LinkClose {
                debug!("link {link_id} closed by remote");
                self.teardown_link(inner, link_id, CloseReason::Remote);
                return;
            }

            if matches!(
                packet.context,
                PacketContext::ResourceAdv
                    | PacketContext::ResourceReq
                    | PacketContext::Resource
                    | PacketContext::ResourceProof
            ) {
                self.handle_resource_frame(inner, link_id, packet.context, &packet.payload);
                return;
            }

            let plaintext = match inner.links.get_mut(&link_id) {
                Some(link) => match link.decrypt_data(&packet.payload, Instant::now()) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("dropping undecryptable link frame: {e}");
                        return;
                    }
                },
                None => {
                    debug!("data for unknown link {link_id}");
                    return;
                }
            };
            let remote_destination = inner.links.get(&link_id).map(|l| l.remote_destination());
            let attached = inner.links.get(&link_id).and_then(|l| l.attached_destination);
            let target = attached.or(remote_destination);
            if let Some(target) = target {
                if let Some(entry) = inner.destinations.get(&target) {
                    if let Some(cb) = &entry.packet_callback {
                        cb(link_id, plaintext);
                    }
                }
            }
            return;
        }

        if let Some(entry) = inner.destinations.get(&packet.destination) {
            let plaintext = match entry.destination.decrypt_with_ratchets(&packet.payload) {
                Ok(p) => p,
                Err(e) => {
                    debug!("dropping undecryptable packet: {e}");
                    return;
                }
            };
            let wants_proof = entry.destination.should_prove(true);
            if let Some(cb) = &entry.packet_callback {
                cb(packet.destination, plaintext);
            }
            if wants_proof {
                self.send_delivery_proof(inner, interface_id, &packet);
            }
            return;
        }

        // Not for us: forward if we know a path.
        let Some(path) = inner.path_table.get(&packet.destination).cloned() else {
            debug!("no path for forwarded packet to {}", packet.destination);
            return;
        };
        let mut forwarded = packet;
        forwarded.hops = forwarded.hops.saturating_add(1);
        let interface_id = path.next_hop_interface;
        let _ = self.send_via(inner, Some(&interface_id), &forwarded);
    }

    fn send_delivery_proof(&self, inner: &mut Inner, interface_id: &str, packet: &Packet) {
        let Some(entry) = inner.destinations.get(&packet.destination) else { return };
        let packet_hash = *packet.hash().as_bytes();
        let mut payload = Vec::with_capacity(96);
        payload.extend_from_slice(&packet_hash);
        payload.extend_from_slice(&entry.destination.identity.sign(&packet_hash));
        let proof = Packet {
            flags: Flags {
                header_type: HeaderType::Type1,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Proof,
                context_flag: 0,
            },
            hops: 0,
            transport_id: None,
            destination: packet.hash().truncate16(),
            context: PacketContext::LinkProof,
            payload,
        };
        let _ = self.send_via(inner, Some(interface_id), &proof);
    }

    /// One maintenance tick: path/reverse-table culling, receipt sweeping,
    /// link keepalive, and announce-queue draining.
    pub async fn run_maintenance_once(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.path_table.cull_expired(now);
        inner.reverse_table.cull_expired(now);

        for hash in inner.receipts.sweep_timeouts(now) {
            let _ = self.receipt_events.send((hash, ReceiptOutcome::Failed));
        }

        let wall_clock_now = now_secs();
        for entry in inner.destinations.values_mut() {
            entry.destination.ratchets.prune_expired(wall_clock_now);
        }
        if let Err(e) = inner.store.save_known_destinations(&inner.known_destinations) {
            warn!("failed to persist known destinations: {e}");
        }

        let keepalive_interval = Duration::from_secs(inner.config.link_keepalive_interval_secs);
        let keepalive_timeout = Duration::from_secs(inner.config.link_keepalive_timeout_secs);
        let mut to_close = Vec::new();
        let mut keepalive_sends = Vec::new();
        for (link_id, link) in inner.links.iter_mut() {
            match link.check_keepalive(now, keepalive_interval, keepalive_timeout) {
                KeepaliveAction::SendKeepalive => keepalive_sends.push(*link_id),
                KeepaliveAction::Close(reason) => to_close.push((*link_id, reason)),
                KeepaliveAction::None => {}
            }
        }
        for (link_id, reason) in to_close {
            self.teardown_link(&mut inner, link_id, reason);
        }
        for link_id in keepalive_sends {
            let remote_destination = inner.links.get(&link_id).map(|l| l.remote_destination());
            let interface_id = remote_destination
                .and_then(|d| inner.path_table.get(&d))
                .map(|p| p.next_hop_interface.clone());
            let keepalive = Packet {
                flags: Flags {
                    header_type: HeaderType::Type1,
                    propagation_type: PropagationType::Broadcast,
                    destination_type: DestinationType::Link,
                    packet_type: PacketType::Data,
                    context_flag: 0,
                },
                hops: 0,
                transport_id: None,
                destination: link_id,
                context: PacketContext::KeepAlive,
                payload: Vec::new(),
            };
            let _ = self.send_via(&mut inner, interface_id.as_deref(), &keepalive);
        }

        let interface_ids: Vec<(String, u64)> =
            inner.interfaces.iter().map(|(id, i)| (id.clone(), i.bitrate())).collect();
        for (id, bitrate) in interface_ids {
            let ready = inner.announce_queue.drain_ready(&id, bitrate, now);
            if ready.is_empty() {
                continue;
            }
            if let Some(iface) = inner.interfaces.get(&id).cloned() {
                for entry in ready {
                    let masked = match iface.ifac() {
                        Some(ifac) => ifac.mask(&entry.packet_bytes),
                        None => entry.packet_bytes,
                    };
                    iface.send(&masked);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::LoopbackInterface;
    use rand_core::OsRng;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn pump(receiver: &mut UnboundedReceiver<Vec<u8>>, transport: &Transport, iface_id: &str) {
        while let Ok(bytes) = receiver.try_recv() {
            transport.handle_inbound(iface_id, &bytes).await;
        }
    }

    #[tokio::test]
    async fn announce_populates_remote_path_table() {
        let mut rng = OsRng;
        let (iface_a, mut rx_a, iface_b, mut rx_b) = LoopbackInterface::pair("a", "b");

        let transport_a = Transport::new(TransportConfig::default(), PrivateIdentity::generate(&mut rng));
        let transport_b = Transport::new(TransportConfig::default(), PrivateIdentity::generate(&mut rng));
        transport_a.register_interface(iface_a).await;
        transport_b.register_interface(iface_b).await;

        let identity = PrivateIdentity::generate(&mut rng);
        let destination = LocalDestination::new(identity, "test", &["a"]);
        let destination_hash = destination.hash;
        transport_b.register_destination(destination, None, None).await;

        transport_b.send_announce(destination_hash, None).await.unwrap();
        transport_b.run_maintenance_once().await;
        pump(&mut rx_a, &transport_a, "a").await;

        let found = {
            let inner = transport_a.inner.lock().await;
            inner.path_table.get(&destination_hash).is_some()
        };
        assert!(found);
        let _ = rx_b.try_recv();
    }

}
