//! Deferred-pass scheduling properties over a simulated command stream:
//! every input-attachment read must be ordered after the color write that
//! produced it, through a declared by-region dependency.

use std::collections::{HashMap, VecDeque};

use vk_sample_engine::backend::{
    AccessMask, ImageLayout, RenderPassDesc, StageMask, TextureFormat, SUBPASS_EXTERNAL,
};
use vk_sample_engine::pipeline::deferred;

/// What one subpass does to the attachments, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Write { subpass: usize, attachment: u32 },
    Read { subpass: usize, attachment: u32 },
}

/// Replay the pass as a flat command stream: each subpass writes its color
/// and depth attachments, then the next subpass runs.
fn simulate(desc: &RenderPassDesc) -> Vec<Op> {
    let mut stream = Vec::new();
    for (subpass, sp) in desc.subpasses.iter().enumerate() {
        for input in &sp.input_attachments {
            stream.push(Op::Read {
                subpass,
                attachment: input.attachment,
            });
        }
        for color in &sp.color_attachments {
            stream.push(Op::Write {
                subpass,
                attachment: color.attachment,
            });
        }
        if let Some(depth) = sp.depth_stencil_attachment {
            stream.push(Op::Write {
                subpass,
                attachment: depth.attachment,
            });
        }
    }
    stream
}

/// Is `from` ordered before `to` through declared internal dependencies?
fn dependency_path_exists(desc: &RenderPassDesc, from: usize, to: usize) -> bool {
    let edges: Vec<(usize, usize)> = desc
        .dependencies
        .iter()
        .filter(|d| d.src_subpass != SUBPASS_EXTERNAL && d.dst_subpass != SUBPASS_EXTERNAL)
        .map(|d| (d.src_subpass as usize, d.dst_subpass as usize))
        .collect();

    let mut queue = VecDeque::from([from]);
    let mut visited = vec![from];
    while let Some(node) = queue.pop_front() {
        if node == to {
            return true;
        }
        for &(src, dst) in &edges {
            if src == node && !visited.contains(&dst) {
                visited.push(dst);
                queue.push_back(dst);
            }
        }
    }
    false
}

#[test]
fn every_input_read_follows_its_producing_write() {
    let desc = deferred::render_pass_desc(TextureFormat::Bgra8UnormSrgb);
    let stream = simulate(&desc);

    for (i, op) in stream.iter().enumerate() {
        let Op::Read {
            subpass,
            attachment,
        } = op
        else {
            continue;
        };

        // The producing write must already be in the stream...
        let writer = stream[..i]
            .iter()
            .filter_map(|prior| match prior {
                Op::Write {
                    subpass,
                    attachment: a,
                } if a == attachment => Some(*subpass),
                _ => None,
            })
            .last();
        let writer = writer.unwrap_or_else(|| {
            panic!("subpass {subpass} reads attachment {attachment} that nothing wrote")
        });

        // ...and a dependency chain must order the writer before the reader.
        assert!(
            dependency_path_exists(&desc, writer, *subpass),
            "no dependency path from subpass {writer} to subpass {subpass} \
             covering attachment {attachment}"
        );
    }
}

#[test]
fn gbuffer_reads_are_fragment_shader_waits_on_color_writes() {
    let desc = deferred::render_pass_desc(TextureFormat::Bgra8UnormSrgb);

    // For each input attachment of the lighting subpass, the covering
    // dependency must wait in the fragment shader for color-attachment
    // writes, by region.
    let lighting = &desc.subpasses[deferred::SUBPASS_LIGHTING as usize];
    assert_eq!(lighting.input_attachments.len(), 3);

    let covering: Vec<_> = desc
        .dependencies
        .iter()
        .filter(|d| {
            d.src_subpass == deferred::SUBPASS_GBUFFER
                && d.dst_subpass == deferred::SUBPASS_LIGHTING
        })
        .collect();
    assert!(!covering.is_empty());

    for dep in covering {
        assert!(dep.by_region, "G-buffer handoff must be tile-local");
        assert!(dep.src_stage.contains(StageMask::COLOR_ATTACHMENT_OUTPUT));
        assert!(dep.dst_stage.contains(StageMask::FRAGMENT_SHADER));
        assert!(dep.src_access.contains(AccessMask::COLOR_ATTACHMENT_WRITE));
        assert!(dep.dst_access.contains(AccessMask::SHADER_READ));
    }
}

#[test]
fn every_dependency_is_same_pixel_by_region() {
    let desc = deferred::render_pass_desc(TextureFormat::Bgra8UnormSrgb);
    assert!(desc.dependencies.iter().all(|d| d.by_region));

    // By-region is only sound because each consumer reads the pixel the
    // producer wrote: all lighting inputs are subpass-local loads.
    let lighting = &desc.subpasses[deferred::SUBPASS_LIGHTING as usize];
    for input in &lighting.input_attachments {
        assert_eq!(input.layout, ImageLayout::ShaderReadOnly);
    }
}

#[test]
fn writer_always_precedes_reader_in_submission_order() {
    let desc = deferred::render_pass_desc(TextureFormat::Bgra8UnormSrgb);
    let mut last_writer: HashMap<u32, usize> = HashMap::new();

    for (subpass, sp) in desc.subpasses.iter().enumerate() {
        for input in &sp.input_attachments {
            let writer = last_writer
                .get(&input.attachment)
                .copied()
                .unwrap_or_else(|| {
                    panic!("attachment {} read before any write", input.attachment)
                });
            assert!(writer < subpass);
        }
        for color in &sp.color_attachments {
            last_writer.insert(color.attachment, subpass);
        }
        if let Some(depth) = sp.depth_stencil_attachment {
            last_writer.insert(depth.attachment, subpass);
        }
    }
}
