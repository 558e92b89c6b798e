//! Core data model shared across the engine crates.

use serde::{Deserialize, Serialize};

/// Channel order of an 8-bit 3-channel image buffer.
///
/// The ONNX models all consume BGR (the OpenCV convention); decoded files
/// arrive as RGB. Conversions happen at model boundaries and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// A contiguous 8-bit, 3-channel image with a known channel order.
#[derive(Debug, Clone)]
pub struct Image {
    width: u32,
    height: u32,
    order: ChannelOrder,
    data: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32, order: ChannelOrder, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 3);
        Self {
            width,
            height,
            order,
            data,
        }
    }

    /// A zero-filled image, useful as a pipeline buffer.
    pub fn zeroed(width: u32, height: u32, order: ChannelOrder) -> Self {
        Self {
            width,
            height,
            order,
            data: vec![0; width as usize * height as usize * 3],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, px: [u8; 3]) {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        self.data[i] = px[0];
        self.data[i + 1] = px[1];
        self.data[i + 2] = px[2];
    }

    /// Convert in place to the requested channel order.
    pub fn into_order(mut self, order: ChannelOrder) -> Self {
        if self.order != order {
            for px in self.data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            self.order = order;
        }
        self
    }
}

/// Axis-aligned rectangle in source pixels, `(left, top, right, bottom)`
/// inclusive-exclusive, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    pub fn diagonal(&self) -> f32 {
        (self.width() * self.width() + self.height() * self.height()).sqrt()
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    pub fn clip(&self, width: u32, height: u32) -> Rect {
        Rect {
            left: self.left.clamp(0.0, width as f32),
            top: self.top.clamp(0.0, height as f32),
            right: self.right.clamp(0.0, width as f32),
            bottom: self.bottom.clamp(0.0, height as f32),
        }
    }

    /// Intersection over union with another rectangle.
    pub fn iou(&self, other: &Rect) -> f32 {
        let x1 = self.left.max(other.left);
        let y1 = self.top.max(other.top);
        let x2 = self.right.min(other.right);
        let y2 = self.bottom.min(other.bottom);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Euclidean distance between the centers of two rectangles.
    pub fn centroid_distance(&self, other: &Rect) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx) * (ax - bx) + (ay - by) * (ay - by)).sqrt()
    }
}

/// A 512-dimensional face identity embedding, L2-normalized on
/// construction.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityVector(Vec<f32>);

impl IdentityVector {
    pub const DIM: usize = 512;

    /// Normalize a raw embedding to unit length. Returns `None` for a
    /// wrong-sized or zero vector.
    pub fn from_raw(mut v: Vec<f32>) -> Option<Self> {
        if v.len() != Self::DIM {
            return None;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if !(norm.is_finite() && norm > 0.0) {
            return None;
        }
        for x in &mut v {
            *x /= norm;
        }
        Some(Self(v))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn norm(&self) -> f32 {
        self.0.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Cosine similarity with another identity. Both sides are unit
    /// length, so this is just the dot product.
    pub fn cosine(&self, other: &IdentityVector) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

/// A face located by the detector, in source-image pixels.
///
/// Landmark order is fixed: left eye, right eye, nose, left mouth corner,
/// right mouth corner.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: Rect,
    pub score: f32,
    pub landmarks: [[f32; 2]; 5],
    /// False when the landmarks were synthesized from box geometry rather
    /// than predicted by the model.
    pub landmarks_predicted: bool,
}

/// A user-selectable face region, optionally bound to a face source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub rect: Rect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_source_id: Option<String>,
}

/// A target identity: an id plus the photo its embedding is extracted from.
#[derive(Debug, Clone)]
pub struct FaceSource {
    pub id: String,
    pub face_image: Image,
}

/// One decoded video frame carrying its decode-order index.
#[derive(Debug)]
pub struct FrameItem {
    pub index: u64,
    pub pixels: Image,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_rects_is_one() {
        let r = Rect::new(10.0, 10.0, 60.0, 60.0);
        assert!((r.iou(&r) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_rects_is_zero() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_overlapping_rects_is_fractional() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(5.0, 5.0, 15.0, 15.0);
        let iou = a.iou(&b);
        assert!(iou > 0.0 && iou < 1.0);
        // 25 overlap, 175 union
        assert!((iou - 25.0 / 175.0).abs() < 1e-6);
    }

    #[test]
    fn channel_order_round_trip() {
        let img = Image::new(2, 1, ChannelOrder::Rgb, vec![1, 2, 3, 4, 5, 6]);
        let bgr = img.clone().into_order(ChannelOrder::Bgr);
        assert_eq!(bgr.data(), &[3, 2, 1, 6, 5, 4]);
        let rgb = bgr.into_order(ChannelOrder::Rgb);
        assert_eq!(rgb.data(), img.data());
    }

    #[test]
    fn into_order_same_order_is_identity() {
        let img = Image::new(1, 1, ChannelOrder::Bgr, vec![9, 8, 7]);
        let same = img.clone().into_order(ChannelOrder::Bgr);
        assert_eq!(same.data(), img.data());
    }

    #[test]
    fn identity_vector_is_unit_after_construction() {
        let raw: Vec<f32> = (0..512).map(|i| (i as f32 * 0.37).sin() * 3.0).collect();
        let v = IdentityVector::from_raw(raw).unwrap();
        assert!((v.norm() - 1.0).abs() < 1e-3);
        assert!((v.cosine(&v) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn identity_vector_rejects_bad_input() {
        assert!(IdentityVector::from_raw(vec![1.0; 100]).is_none());
        assert!(IdentityVector::from_raw(vec![0.0; 512]).is_none());
        let mut nan = vec![1.0f32; 512];
        nan[7] = f32::NAN;
        assert!(IdentityVector::from_raw(nan).is_none());
    }

    #[test]
    fn centroid_distance_matches_geometry() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(30.0, 40.0, 40.0, 50.0);
        // centers (5,5) and (35,45): distance 50
        assert!((a.centroid_distance(&b) - 50.0).abs() < 1e-4);
    }
}
