/// Detection box in original image pixels, xyxy.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bbox {
    xmin: f32,
    ymin: f32,
    xmax: f32,
    ymax: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
            id,
            confidence,
        }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmax
    }

    pub fn ymax(&self) -> f32 {
        self.ymax
    }

    pub fn xyxy(&self) -> [f32; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.) * self.height().max(0.)
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax.min(another.xmax);
        let t = self.ymin.max(another.ymin);
        let b = self.ymax.min(another.ymax);
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        let union = self.union(another);
        if union <= 0. {
            return 0.;
        }
        self.intersection_area(another) / union
    }

    /// Clamp to `[0, width] x [0, height]`.
    pub fn clamp(self, width: f32, height: f32) -> Self {
        Self {
            xmin: self.xmin.clamp(0., width),
            ymin: self.ymin.clamp(0., height),
            xmax: self.xmax.clamp(0., width),
            ymax: self.ymax.clamp(0., height),
            ..self
        }
    }
}

/// Class-aware non-max suppression. Survivors come back sorted by
/// confidence, highest first.
pub fn non_max_suppression(mut boxes: Vec<Bbox>, iou_threshold: f32) -> Vec<Bbox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Bbox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let suppressed = kept
            .iter()
            .any(|k| k.id == candidate.id && k.iou(&candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_overlapping_boxes() {
        let a = Bbox::new(0., 0., 10., 10., 0, 0.9);
        let b = Bbox::new(5., 0., 15., 10., 0, 0.8);
        assert_eq!(a.intersection_area(&b), 50.);
        assert!((a.iou(&b) - 50. / 150.).abs() < 1e-6);
    }

    #[test]
    fn disjoint_boxes_have_zero_iou() {
        let a = Bbox::new(0., 0., 1., 1., 0, 0.9);
        let b = Bbox::new(5., 5., 6., 6., 0, 0.9);
        assert_eq!(a.iou(&b), 0.);
    }

    #[test]
    fn degenerate_box_iou_is_zero() {
        let a = Bbox::new(1., 1., 1., 1., 0, 0.9);
        assert_eq!(a.iou(&a), 0.);
    }

    #[test]
    fn nms_keeps_best_per_class() {
        let boxes = vec![
            Bbox::new(0., 0., 10., 10., 0, 0.6),
            Bbox::new(1., 1., 10., 10., 0, 0.9),
            Bbox::new(1., 1., 10., 10., 1, 0.7),
            Bbox::new(50., 50., 60., 60., 0, 0.3),
        ];
        let kept = non_max_suppression(boxes, 0.45);
        let confs: Vec<f32> = kept.iter().map(Bbox::confidence).collect();
        assert_eq!(confs, vec![0.9, 0.7, 0.3]);
        assert_eq!(kept[1].id(), 1);
    }

    #[test]
    fn clamp_to_image() {
        let b = Bbox::new(-4., 2., 120., 90., 3, 0.5).clamp(100., 80.);
        assert_eq!(b.xyxy(), [0., 2., 100., 80.]);
        assert_eq!(b.id(), 3);
    }
}
