use image::GrayImage;

/// Single-channel float image with intensities in [0, 1].
#[derive(Debug, Clone)]
pub struct Level {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Level {
    pub fn from_gray(image: &GrayImage) -> Self {
        let (w, h) = image.dimensions();
        Self {
            width: w as usize,
            height: h as usize,
            data: image.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Pixel at integer coordinates, clamped to the border.
    pub fn get(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.data[y * self.width + x]
    }

    /// Bilinear sample with border clamping.
    pub fn sample(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (xi, yi) = (x0 as isize, y0 as isize);

        let top = self.get(xi, yi) * (1.0 - fx) + self.get(xi + 1, yi) * fx;
        let bottom = self.get(xi, yi + 1) * (1.0 - fx) + self.get(xi + 1, yi + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Central-difference gradient at a sub-pixel position.
    pub fn gradient(&self, x: f32, y: f32) -> (f32, f32) {
        let gx = 0.5 * (self.sample(x + 1.0, y) - self.sample(x - 1.0, y));
        let gy = 0.5 * (self.sample(x, y + 1.0) - self.sample(x, y - 1.0));
        (gx, gy)
    }

    /// 2×2 box-filtered half-resolution copy.
    fn downsample(&self) -> Self {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let (sx, sy) = ((2 * x) as isize, (2 * y) as isize);
                let sum = self.get(sx, sy)
                    + self.get(sx + 1, sy)
                    + self.get(sx, sy + 1)
                    + self.get(sx + 1, sy + 1);
                data.push(sum * 0.25);
            }
        }
        Self {
            width,
            height,
            data,
        }
    }
}

/// Coarse-to-fine stack; level 0 is full resolution.
#[derive(Debug, Clone)]
pub struct Pyramid {
    pub levels: Vec<Level>,
}

/// Levels stop once either side would drop below this.
const MIN_LEVEL_SIDE: usize = 16;

impl Pyramid {
    pub fn build(image: &GrayImage, max_levels: usize) -> Self {
        let mut levels = vec![Level::from_gray(image)];
        while levels.len() < max_levels.max(1) {
            let last = &levels[levels.len() - 1];
            if last.width() / 2 < MIN_LEVEL_SIDE || last.height() / 2 < MIN_LEVEL_SIDE {
                break;
            }
            let next = last.downsample();
            levels.push(next);
        }
        Self { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn levels_halve_until_minimum() {
        let img = GrayImage::new(128, 64);
        let pyr = Pyramid::build(&img, 5);
        let sizes: Vec<_> = pyr.levels.iter().map(|l| (l.width(), l.height())).collect();
        assert_eq!(sizes, vec![(128, 64), (64, 32), (32, 16)]);
    }

    #[test]
    fn bilinear_sample_interpolates() {
        let img = GrayImage::from_fn(2, 1, |x, _| image::Luma([if x == 0 { 0 } else { 255 }]));
        let level = Level::from_gray(&img);
        assert_relative_eq!(level.sample(0.5, 0.0), 0.5);
        assert_relative_eq!(level.sample(-3.0, 0.0), 0.0);
        assert_relative_eq!(level.sample(7.0, 0.0), 1.0);
    }

    #[test]
    fn gradient_of_horizontal_ramp() {
        let img = GrayImage::from_fn(32, 8, |x, _| image::Luma([(x * 4) as u8]));
        let level = Level::from_gray(&img);
        let (gx, gy) = level.gradient(10.0, 4.0);
        assert_relative_eq!(gx, 4.0 / 255.0, epsilon = 1e-6);
        assert_relative_eq!(gy, 0.0);
    }
}
