use shared::domain::{RawBlock, TextBlock};

pub struct Preprocessor;

impl Preprocessor {
    pub fn normalize_block_text(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Drops empty blocks, normalises text, attaches centres and sorts into
    /// reading order: top to bottom, then left to right.
    pub fn preprocess_blocks(blocks: &[RawBlock]) -> Vec<TextBlock> {
        let mut cleaned: Vec<TextBlock> = blocks
            .iter()
            .filter(|block| !block.text.trim().is_empty())
            .map(|block| {
                let (px, py) = block.bbox.center();
                TextBlock {
                    text: Self::normalize_block_text(&block.text),
                    bbox: block.bbox,
                    px,
                    py,
                }
            })
            .collect();

        cleaned.sort_by(|a, b| {
            round3(a.bbox.y0)
                .total_cmp(&round3(b.bbox.y0))
                .then_with(|| round3(a.bbox.x0).total_cmp(&round3(b.bbox.x0)))
        });
        cleaned
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
