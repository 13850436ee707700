//! Frame forwarder.
//!
//! Outbound: frames from a VIF are tagged (if the VIF has a VLAN id),
//! paired with a [`SendCompletion`] naming their VIF and handed to the lower
//! binding in one batch. Inbound: each frame from the lower binding is
//! fanned out to every VIF whose filter matches, each VIF bounded by its
//! own receive queue.

use std::fmt;
use std::sync::Arc;

use smoltcp::wire::EthernetFrame;
use tracing::{debug, trace};

use crate::binding::{Binding, BindingRef};
use crate::error::{MuxError, Result};
use crate::lower::{FrameCookie, LowerError, LowerFrame, LowerResult, SendFlags};
use crate::mac::MacAddr;
use crate::stats::Statistic;
use crate::vif::{ReceivedFrame, Vif, VifId, VifRef};
use crate::vlan::{self, ETH_HEADER_LEN, TagError, TagInfo};

/// A frame handed down by the upper edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub data: Vec<u8>,
    /// Priority and VLAN id requested for this frame.
    pub tag: Option<TagInfo>,
    pub cookie: FrameCookie,
}

impl OutboundFrame {
    pub fn new(data: Vec<u8>, cookie: FrameCookie) -> Self {
        Self {
            data,
            tag: None,
            cookie,
        }
    }

    pub fn with_tag(mut self, tag: TagInfo) -> Self {
        self.tag = Some(tag);
        self
    }
}

struct SendContext {
    vif: VifRef,
    _binding: BindingRef,
}

/// Completion state of one frame in flight below.
///
/// Holds the sending VIF and the binding until the lower binding reports a
/// result. Dropped unreported, it completes the frame with
/// [`LowerError::Aborted`].
pub(crate) struct SendCompletion {
    vif_id: VifId,
    cookie: FrameCookie,
    inner: Option<SendContext>,
}

impl SendCompletion {
    fn new(vif: VifRef, binding: BindingRef, cookie: FrameCookie) -> Self {
        Self {
            vif_id: vif.id(),
            cookie,
            inner: Some(SendContext {
                vif,
                _binding: binding,
            }),
        }
    }

    pub(crate) fn vif_id(&self) -> VifId {
        self.vif_id
    }

    pub(crate) fn cookie(&self) -> FrameCookie {
        self.cookie
    }

    pub(crate) fn complete(mut self, result: LowerResult<()>) {
        self.finish(result);
    }

    fn finish(&mut self, result: LowerResult<()>) {
        let Some(ctx) = self.inner.take() else {
            return;
        };
        let vif = &ctx.vif;
        let result = match result {
            Ok(()) => {
                vif.stats().incr(Statistic::GoodTransmits);
                Ok(())
            }
            Err(e) => {
                vif.stats().incr(Statistic::TransmitErrors);
                debug!(vif = %self.vif_id, cookie = %self.cookie, error = %e, "send failed");
                Err(MuxError::from(e))
            }
        };
        vif.sends.put();
        if let Some(handler) = vif.handler() {
            handler.send_complete(self.vif_id, self.cookie, result);
        }
    }
}

impl Drop for SendCompletion {
    fn drop(&mut self) {
        self.finish(Err(LowerError::Aborted));
    }
}

impl fmt::Debug for SendCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendCompletion")
            .field("vif", &self.vif_id)
            .field("cookie", &self.cookie)
            .field("done", &self.inner.is_none())
            .finish()
    }
}

/// Complete a frame that never reached the lower binding.
fn reject(vif: &Vif, cookie: FrameCookie, error: MuxError) {
    vif.stats().incr(Statistic::TransmitErrors);
    debug!(vif = %vif.id(), cookie = %cookie, error = %error, "send rejected");
    if let Some(handler) = vif.handler() {
        handler.send_complete(vif.id(), cookie, Err(error));
    }
}

/// Send a batch of frames on `vif`.
///
/// Fails as a whole only if the VIF is not accepting work. Otherwise every
/// frame is completed through the VIF's handler: frames that could not be
/// admitted right away, the rest once the lower binding reports them.
/// When the send pool runs out, that frame and all after it complete with
/// [`MuxError::Resources`].
pub(crate) fn send_frames(vif: &Arc<Vif>, frames: Vec<OutboundFrame>) -> Result<()> {
    let _guard = vif.enter()?;
    let binding = vif.binding().ok_or(MuxError::BindingClosing)?;
    let vlan_id = vif.vlan_id();

    let mut batch = Vec::with_capacity(frames.len());
    let mut frames = frames.into_iter();
    while let Some(frame) = frames.next() {
        if !vif.sends.try_take() {
            reject(vif, frame.cookie, MuxError::Resources);
            for rest in frames.by_ref() {
                reject(vif, rest.cookie, MuxError::Resources);
            }
            break;
        }

        let data = match vlan::tag_outbound(frame.data, vlan_id, frame.tag) {
            Ok(data) => data,
            Err(e) => {
                vif.sends.put();
                reject(vif, frame.cookie, e);
                continue;
            }
        };

        let admitted = vif
            .enter()
            .and_then(|vif_ref| Ok((vif_ref, binding.pin().ok_or(MuxError::BindingClosing)?)));
        match admitted {
            Ok((vif_ref, binding_ref)) => batch.push(LowerFrame::new(
                data,
                SendFlags::NO_LOOPBACK,
                SendCompletion::new(vif_ref, binding_ref, frame.cookie),
            )),
            Err(e) => {
                vif.sends.put();
                reject(vif, frame.cookie, e);
            }
        }
    }

    if !batch.is_empty() {
        trace!(vif = %vif.id(), frames = batch.len(), "submitting frames");
        binding.lower().submit_frames(batch);
    }
    Ok(())
}

impl Binding {
    /// Frame indication from the lower binding, split the way adapters
    /// report it: the Ethernet header, the lookahead data following it, and
    /// the size of the data following the header.
    ///
    /// Frames whose lookahead does not cover the whole frame are dropped.
    /// Returns the number of VIFs the frame was indicated to.
    pub fn indicate_receive(
        self: &Arc<Self>,
        header: &[u8],
        lookahead: &[u8],
        frame_size: usize,
    ) -> usize {
        if header.len() != ETH_HEADER_LEN {
            debug!(binding = %self.id(), len = header.len(), "bad header length, dropped");
            return 0;
        }
        if lookahead.len() < frame_size {
            debug!(
                binding = %self.id(),
                lookahead = lookahead.len(),
                frame_size,
                "partial lookahead, dropped"
            );
            return 0;
        }

        let mut frame = Vec::with_capacity(ETH_HEADER_LEN + frame_size);
        frame.extend_from_slice(header);
        frame.extend_from_slice(&lookahead[..frame_size]);
        self.indicate_frame(&frame)
    }

    /// Fan a complete frame out to the matching VIFs.
    pub fn indicate_frame(self: &Arc<Self>, frame: &[u8]) -> usize {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            debug!(binding = %self.id(), len = frame.len(), "runt frame, dropped");
            return 0;
        };
        let dst = MacAddr::from(eth.dst_addr());
        let src = MacAddr::from(eth.src_addr());

        if self.packet_filter().is_empty() {
            return 0;
        }

        let tag = vlan::peek_tag(frame);
        let data = match tag {
            Some(_) => vlan::strip_tag(frame),
            None => frame.to_vec(),
        };

        let mut indicated = 0;
        for vif in self.vifs() {
            if vif.power_state().is_low_power() {
                continue;
            }
            let Ok(vif_ref) = vif.enter() else {
                continue;
            };
            if src == vif.current_address() || !vif.accepts(dst) {
                continue;
            }

            if let Some(tag) = &tag {
                match vlan::accept_inbound(tag, vif.vlan_id()) {
                    Ok(()) => {}
                    Err(TagError::Format) => {
                        vif.stats().incr(Statistic::ReceiveFormatErrors);
                        debug!(vif = %vif.id(), "tagged frame with CFI, dropped");
                        continue;
                    }
                    Err(e @ TagError::VlanId { .. }) => {
                        vif.stats().incr(Statistic::ReceiveVlanIdErrors);
                        debug!(vif = %vif.id(), error = %e, "dropped");
                        continue;
                    }
                }
            }

            if !vif.receive_queue.try_take() {
                vif.stats().incr(Statistic::ReceiveResourceErrors);
                debug!(
                    vif = %vif.id(),
                    capacity = vif.receive_queue_capacity(),
                    "receive queue full, dropped"
                );
                continue;
            }
            let Some(binding_ref) = self.pin() else {
                vif.receive_queue.put();
                break;
            };

            let received = ReceivedFrame::new(data.clone(), tag, vif_ref, binding_ref);
            vif.stats().incr(Statistic::GoodReceives);
            if let Some(handler) = vif.handler() {
                handler.frame_indicated(received);
                indicated += 1;
            }
        }
        indicated
    }
}
