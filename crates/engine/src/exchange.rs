//! Cross-node exchange: cell metadata after a rebuild, stray particles
//! after a drift.

use std::time::Duration;

use kernel::part::PartnerRef;
use kernel::{GPart, Part, SPart, XPart};

use crate::error::{EngineError, Result};
use crate::proxy::{
    pack_cells, unpack_cells, PCell, Proxy, StrayGPartMsg, StrayPartMsg, StraySPartMsg,
    TAG_CELL_COUNTS, TAG_CELL_PCELLS, TAG_STRAY_COUNTS, TAG_STRAY_GPARTS,
    TAG_STRAY_PARTS, TAG_STRAY_SPARTS,
};
use crate::space::Space;
use crate::transport::Transport;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Exchange the cell skeletons with every proxy peer: counts first so the
/// receiver can size its buffers, packed subtrees second, then link the
/// rebuilt foreign cells to slices of the foreign particle arrays.
pub fn exchange_cells(
    space: &mut Space,
    proxies: &[Proxy],
    transport: &dyn Transport,
    node_id: usize,
) -> Result<()> {
    // Phase 1: pack and post.
    for p in proxies {
        let mut pcells: Vec<PCell> = Vec::new();
        for &cid in &p.cells_out {
            pack_cells(space, cid, &mut pcells);
        }
        let count = pcells.len() as u64;
        transport.send(p.peer, TAG_CELL_COUNTS, count.to_le_bytes().to_vec())?;
        transport.send(p.peer, TAG_CELL_PCELLS, bytemuck::cast_slice(&pcells).to_vec())?;
    }

    // Phase 2: receive and unpack, assigning contiguous foreign ranges.
    let mut offsets = [0usize; 3];
    for p in proxies {
        let count_bytes = transport.recv_timeout(p.peer, TAG_CELL_COUNTS, EXCHANGE_TIMEOUT)?;
        let arr: [u8; 8] = count_bytes.as_slice().try_into().map_err(|_| {
            EngineError::Communication {
                node: node_id,
                peer: p.peer,
                detail: "short cell-count message".to_string(),
            }
        })?;
        let expect = u64::from_le_bytes(arr) as usize;

        let bytes = transport.recv_timeout(p.peer, TAG_CELL_PCELLS, EXCHANGE_TIMEOUT)?;
        // Decode by copy; the byte buffer carries no alignment guarantee.
        let pcells: Vec<PCell> = bytemuck::pod_collect_to_vec(&bytes);
        if pcells.len() != expect {
            return Err(EngineError::Communication {
                node: node_id,
                peer: p.peer,
                detail: format!(
                    "expected {} packed cells, got {}",
                    expect,
                    pcells.len()
                ),
            });
        }

        let mut used = 0usize;
        for &cid in &p.cells_in {
            used += unpack_cells(space, cid, &pcells[used..], p.peer, &mut offsets)?;
        }
        if used != pcells.len() {
            return Err(EngineError::Communication {
                node: node_id,
                peer: p.peer,
                detail: format!("{} packed cells left over after unpack", pcells.len() - used),
            });
        }
    }

    // Size the foreign arrays for the ranges just handed out, with the
    // usual growth margin.
    let filler_part = Part::new([0.0; 3], 1.0e-3, 0.0, u64::MAX);
    grow_to(space.parts_foreign.get_mut(), offsets[0], &filler_part);
    let filler_gpart = GPart::dark_matter([0.0; 3], 0.0, 0);
    grow_to(space.gparts_foreign.get_mut(), offsets[1], &filler_gpart);
    let filler_spart = SPart::new([0.0; 3], 0.0, u64::MAX);
    grow_to(space.sparts_foreign.get_mut(), offsets[2], &filler_spart);

    tracing::debug!(
        "cell exchange complete: {} foreign parts, {} foreign gparts, {} foreign sparts",
        offsets[0],
        offsets[1],
        offsets[2]
    );
    Ok(())
}

fn grow_to<T: Clone>(v: &mut Vec<T>, len: usize, filler: &T) {
    if v.len() < len {
        let target = (len as f64 * 1.1) as usize;
        v.reserve(target - v.len());
        v.resize(len, filler.clone());
    } else {
        v.truncate(len);
    }
}

/// Ship every stray particle to the node that owns its new cell and take in
/// whatever the peers send back. Returns `(sent, received)` particle
/// totals.
pub fn exchange_strays(
    space: &mut Space,
    proxies: &[Proxy],
    transport: &dyn Transport,
    node_id: usize,
) -> Result<(usize, usize)> {
    let batch = space.collect_strays(node_id)?;
    let sent = batch.len();

    // Bucket the batch per destination, rebasing the gas/star partner
    // indices from batch-local to buffer-local.
    let nr_proxies = proxies.len();
    let proxy_of = |node: usize| -> Result<usize> {
        proxies
            .iter()
            .position(|p| p.peer == node)
            .ok_or(EngineError::InvariantViolation {
                node: node_id,
                location: "exchange::exchange_strays",
                detail: format!("no proxy for destination node {}", node),
            })
    };

    let mut parts_out: Vec<Vec<StrayPartMsg>> = vec![Vec::new(); nr_proxies];
    let mut gparts_out: Vec<Vec<StrayGPartMsg>> = vec![Vec::new(); nr_proxies];
    let mut sparts_out: Vec<Vec<StraySPartMsg>> = vec![Vec::new(); nr_proxies];

    // Batch-local index -> (proxy, buffer-local index).
    let mut part_slot = Vec::with_capacity(batch.parts.len());
    for (p, xp, dest) in &batch.parts {
        let pid = proxy_of(*dest)?;
        part_slot.push((pid, parts_out[pid].len() as i64));
        parts_out[pid].push(StrayPartMsg {
            x: p.x,
            id: p.id,
            v: p.v,
            v_full: xp.v_full,
            h: p.h,
            mass: p.mass,
            entropy: p.entropy,
            u_full: xp.u_full,
            time_bin: p.time_bin as i32,
            pad: 0,
        });
    }
    let mut spart_slot = Vec::with_capacity(batch.sparts.len());
    for (s, dest) in &batch.sparts {
        let pid = proxy_of(*dest)?;
        spart_slot.push((pid, sparts_out[pid].len() as i64));
        sparts_out[pid].push(StraySPartMsg {
            x: s.x,
            id: s.id,
            v: s.v,
            mass: s.mass,
            h: s.h,
            time_bin: s.time_bin as i32,
            pad: [0; 2],
        });
    }
    for (g, dest) in &batch.gparts {
        let pid = proxy_of(*dest)?;
        let (partner_kind, partner) = match g.partner {
            PartnerRef::DarkMatter(id) => (0, id),
            PartnerRef::Gas(i) => {
                let (slot_pid, local) = part_slot[i as usize];
                debug_assert_eq!(slot_pid, pid);
                (1, local)
            }
            PartnerRef::Star(i) => {
                let (slot_pid, local) = spart_slot[i as usize];
                debug_assert_eq!(slot_pid, pid);
                (2, local)
            }
        };
        gparts_out[pid].push(StrayGPartMsg {
            x: g.x,
            partner,
            v_full: g.v_full,
            mass: g.mass,
            time_bin: g.time_bin as i32,
            partner_kind,
        });
    }

    // Counts first, payloads after; everything is posted before anything is
    // awaited so the exchange cannot deadlock.
    for (pid, p) in proxies.iter().enumerate() {
        let counts = [
            parts_out[pid].len() as u64,
            gparts_out[pid].len() as u64,
            sparts_out[pid].len() as u64,
        ];
        let mut bytes = Vec::with_capacity(24);
        for c in counts {
            bytes.extend_from_slice(&c.to_le_bytes());
        }
        transport.send(p.peer, TAG_STRAY_COUNTS, bytes)?;
        if !parts_out[pid].is_empty() {
            transport.send(
                p.peer,
                TAG_STRAY_PARTS,
                bytemuck::cast_slice(&parts_out[pid]).to_vec(),
            )?;
        }
        if !gparts_out[pid].is_empty() {
            transport.send(
                p.peer,
                TAG_STRAY_GPARTS,
                bytemuck::cast_slice(&gparts_out[pid]).to_vec(),
            )?;
        }
        if !sparts_out[pid].is_empty() {
            transport.send(
                p.peer,
                TAG_STRAY_SPARTS,
                bytemuck::cast_slice(&sparts_out[pid]).to_vec(),
            )?;
        }
    }

    let mut received = 0usize;
    for p in proxies {
        let bytes = transport.recv_timeout(p.peer, TAG_STRAY_COUNTS, EXCHANGE_TIMEOUT)?;
        if bytes.len() != 24 {
            return Err(EngineError::Communication {
                node: node_id,
                peer: p.peer,
                detail: "short stray-count message".to_string(),
            });
        }
        let n_parts = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or([0; 8])) as usize;
        let n_gparts = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or([0; 8])) as usize;
        let n_sparts = u64::from_le_bytes(bytes[16..24].try_into().unwrap_or([0; 8])) as usize;
        received += n_parts + n_gparts + n_sparts;

        let mut parts_in: Vec<(Part, XPart)> = Vec::with_capacity(n_parts);
        if n_parts > 0 {
            let bytes = transport.recv_timeout(p.peer, TAG_STRAY_PARTS, EXCHANGE_TIMEOUT)?;
            let msgs: Vec<StrayPartMsg> = bytemuck::pod_collect_to_vec(&bytes);
            for m in &msgs {
                let mut part = Part::new(m.x, m.h, m.mass, m.id);
                part.v = m.v;
                part.entropy = m.entropy;
                part.time_bin = m.time_bin as i8;
                let xp = XPart {
                    x_diff: [0.0; 3],
                    x_diff_sort: [0.0; 3],
                    v_full: m.v_full,
                    u_full: m.u_full,
                };
                parts_in.push((part, xp));
            }
        }
        let mut gparts_in: Vec<GPart> = Vec::with_capacity(n_gparts);
        if n_gparts > 0 {
            let bytes = transport.recv_timeout(p.peer, TAG_STRAY_GPARTS, EXCHANGE_TIMEOUT)?;
            let msgs: Vec<StrayGPartMsg> = bytemuck::pod_collect_to_vec(&bytes);
            for m in &msgs {
                let partner = match m.partner_kind {
                    0 => PartnerRef::DarkMatter(m.partner),
                    1 => PartnerRef::Gas(m.partner as u32),
                    2 => PartnerRef::Star(m.partner as u32),
                    other => {
                        return Err(EngineError::Communication {
                            node: node_id,
                            peer: p.peer,
                            detail: format!("bad partner kind {}", other),
                        })
                    }
                };
                gparts_in.push(GPart {
                    x: m.x,
                    v_full: m.v_full,
                    a_grav: [0.0; 3],
                    mass: m.mass,
                    time_bin: m.time_bin as i8,
                    partner,
                });
            }
        }
        let mut sparts_in: Vec<SPart> = Vec::with_capacity(n_sparts);
        if n_sparts > 0 {
            let bytes = transport.recv_timeout(p.peer, TAG_STRAY_SPARTS, EXCHANGE_TIMEOUT)?;
            let msgs: Vec<StraySPartMsg> = bytemuck::pod_collect_to_vec(&bytes);
            for m in &msgs {
                let mut s = SPart::new(m.x, m.mass, m.id);
                s.v = m.v;
                s.h = m.h;
                s.time_bin = m.time_bin as i8;
                sparts_in.push(s);
            }
        }

        space.append_received(parts_in, gparts_in, sparts_in);
    }

    if sent > 0 || received > 0 {
        tracing::debug!("stray exchange: {} out, {} in", sent, received);
    }
    space.verify_linkage(node_id)?;
    Ok((sent, received))
}
