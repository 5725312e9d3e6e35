//! Escape-time Mandelbrot kernel for the software device.

use bytemuck::{Pod, Zeroable};
use tessera_gpu::backend::soft::KernelContext;

/// Workgroup edge length, matching an 8x8 compute shader.
pub const GROUP_SIZE: u32 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PushConstants {
    pub width: u32,
    pub height: u32,
    pub max_iterations: u32,
    pub _pad: u32,
}

/// Iterations before `c` escapes, capped at `max_iterations`.
pub fn escape_time(cx: f64, cy: f64, max_iterations: u32) -> u32 {
    let (mut x, mut y) = (0.0f64, 0.0f64);
    let mut i = 0;
    while i < max_iterations && x * x + y * y <= 4.0 {
        let xt = x * x - y * y + cx;
        y = 2.0 * x * y + cy;
        x = xt;
        i += 1;
    }
    i
}

/// Map an iteration count to RGBA8. Points inside the set are black.
pub fn shade(iterations: u32, max_iterations: u32) -> [u8; 4] {
    if iterations >= max_iterations {
        return [0, 0, 0, 255];
    }
    let t = f64::from(iterations) / f64::from(max_iterations);
    let channel = |v: f64| (v.clamp(0.0, 1.0) * 255.0) as u8;
    [
        channel(9.0 * (1.0 - t) * t * t * t),
        channel(15.0 * (1.0 - t) * (1.0 - t) * t * t),
        channel(8.5 * (1.0 - t) * (1.0 - t) * (1.0 - t) * t),
        255,
    ]
}

/// Fill storage image 0, one texel per invocation.
pub fn mandelbrot(ctx: &mut KernelContext<'_>) {
    let Some(push) = ctx.push_constant::<PushConstants>(0) else {
        return;
    };
    let [gx, gy, _] = ctx.workgroups;
    let Some(image) = ctx.images.first_mut() else {
        return;
    };

    // Fit [-2.5, 1] x [-1.25, 1.25] into the image, keeping squares square.
    let scale = (3.5 / f64::from(push.width)).max(2.5 / f64::from(push.height));
    let center = (-0.75, 0.0);
    for y in 0..(gy * GROUP_SIZE).min(push.height) {
        for x in 0..(gx * GROUP_SIZE).min(push.width) {
            let cx = center.0 + (f64::from(x) - f64::from(push.width) / 2.0) * scale;
            let cy = center.1 + (f64::from(y) - f64::from(push.height) / 2.0) * scale;
            let iterations = escape_time(cx, cy, push.max_iterations);
            image.write_texel(x, y, &shade(iterations, push.max_iterations));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_never_escapes() {
        assert_eq!(escape_time(0.0, 0.0, 100), 100);
        assert_eq!(shade(100, 100), [0, 0, 0, 255]);
    }

    #[test]
    fn far_points_escape_immediately() {
        assert_eq!(escape_time(3.0, 3.0, 100), 1);
        assert_eq!(shade(1, 100)[3], 255);
    }
}
