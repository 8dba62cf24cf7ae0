//! 混同行列のヒートマップ（SVG）

use std::fs;
use std::path::Path;

use crate::report::metrics::ConfusionMatrix;

const CELL_SIZE: f64 = 60.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_LEFT: f64 = 120.0;
const MARGIN_BOTTOM: f64 = 110.0;
const COLORBAR_GAP: f64 = 30.0;
const COLORBAR_WIDTH: f64 = 20.0;
const MARGIN_RIGHT: f64 = 80.0;

const COLOR_TEXT: &str = "#2c3e50";

/// matplotlibの "Blues" を近似した色の基準点（0.0 → 1.0）
const BLUES: [(u8, u8, u8); 5] = [
    (247, 251, 255),
    (198, 219, 239),
    (107, 174, 214),
    (33, 113, 181),
    (8, 48, 107),
];

/// `t` (0.0..=1.0) に対応する "Blues" の色
pub fn blues(t: f64) -> (u8, u8, u8) {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let scaled = t * (BLUES.len() - 1) as f64;
    let i = (scaled.floor() as usize).min(BLUES.len() - 2);
    let frac = scaled - i as f64;

    let lerp = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * frac).round() as u8;
    let (r0, g0, b0) = BLUES[i];
    let (r1, g1, b1) = BLUES[i + 1];
    (lerp(r0, r1), lerp(g0, g1), lerp(b0, b1))
}

fn hex((r, g, b): (u8, u8, u8)) -> String {
    format!("#{:02x}{:02x}{:02x}", r, g, b)
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// 混同行列をSVG文字列にする
///
/// セルには件数を表示し、x軸のクラス名は45度回転させます。
pub fn render_confusion_heatmap(matrix: &ConfusionMatrix, class_names: &[String], title: &str) -> String {
    let n = matrix.num_classes();
    let grid = CELL_SIZE * n as f64;
    let width = MARGIN_LEFT + grid + COLORBAR_GAP + COLORBAR_WIDTH + MARGIN_RIGHT;
    let height = MARGIN_TOP + grid + MARGIN_BOTTOM;
    let max = matrix.max_count().max(1) as f64;

    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {} {}" width="{}" height="{}">"#,
        width, height, width, height
    ));
    svg.push_str(&format!(
        r#"<rect width="{}" height="{}" fill="white"/>"#,
        width, height
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="35" text-anchor="middle" font-family="Arial, sans-serif" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
        MARGIN_LEFT + grid / 2.0,
        COLOR_TEXT,
        escape(title)
    ));

    for (row, counts) in matrix.rows().iter().enumerate() {
        for (col, &count) in counts.iter().enumerate() {
            let t = count as f64 / max;
            let x = MARGIN_LEFT + col as f64 * CELL_SIZE;
            let y = MARGIN_TOP + row as f64 * CELL_SIZE;
            svg.push_str(&format!(
                r#"<rect x="{}" y="{}" width="{}" height="{}" fill="{}" stroke="white"/>"#,
                x,
                y,
                CELL_SIZE,
                CELL_SIZE,
                hex(blues(t))
            ));
            // 濃いセルは白文字
            let text_color = if t > 0.5 { "white" } else { COLOR_TEXT };
            svg.push_str(&format!(
                r#"<text x="{}" y="{}" text-anchor="middle" dominant-baseline="middle" font-family="Arial, sans-serif" font-size="13" fill="{}">{}</text>"#,
                x + CELL_SIZE / 2.0,
                y + CELL_SIZE / 2.0,
                text_color,
                count
            ));
        }
    }

    for (i, name) in class_names.iter().take(n).enumerate() {
        let center = i as f64 * CELL_SIZE + CELL_SIZE / 2.0;
        let name = escape(name);

        // y軸（正解）
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" dominant-baseline="middle" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
            MARGIN_LEFT - 8.0,
            MARGIN_TOP + center,
            COLOR_TEXT,
            name
        ));

        // x軸（予測）
        let x = MARGIN_LEFT + center;
        let y = MARGIN_TOP + grid + 14.0;
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" font-family="Arial, sans-serif" font-size="12" fill="{}" transform="rotate(-45 {} {})">{}</text>"#,
            x, y, COLOR_TEXT, x, y, name
        ));
    }

    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}">Predicted</text>"#,
        MARGIN_LEFT + grid / 2.0,
        height - 15.0,
        COLOR_TEXT
    ));
    svg.push_str(&format!(
        r#"<text x="20" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}" transform="rotate(-90 20 {})">True</text>"#,
        MARGIN_TOP + grid / 2.0,
        COLOR_TEXT,
        MARGIN_TOP + grid / 2.0
    ));

    // カラーバー（上が最大値）
    let bar_x = MARGIN_LEFT + grid + COLORBAR_GAP;
    let steps = 50;
    let step_height = grid / steps as f64;
    for s in 0..steps {
        let t = 1.0 - s as f64 / (steps - 1) as f64;
        svg.push_str(&format!(
            r#"<rect x="{}" y="{}" width="{}" height="{}" fill="{}"/>"#,
            bar_x,
            MARGIN_TOP + s as f64 * step_height,
            COLORBAR_WIDTH,
            step_height + 0.5,
            hex(blues(t))
        ));
    }
    for (value, y) in [(max as usize, MARGIN_TOP), (0, MARGIN_TOP + grid)] {
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" dominant-baseline="middle" font-family="Arial, sans-serif" font-size="11" fill="{}">{}</text>"#,
            bar_x + COLORBAR_WIDTH + 6.0,
            y,
            COLOR_TEXT,
            value
        ));
    }

    svg.push_str("</svg>");
    svg
}

/// ヒートマップをファイルに書き出す
pub fn save_confusion_heatmap(
    matrix: &ConfusionMatrix,
    class_names: &[String],
    title: &str,
    output_path: &Path,
) -> std::io::Result<()> {
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(output_path, render_confusion_heatmap(matrix, class_names, title))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_blues_endpoints() {
        assert_eq!(blues(0.0), BLUES[0]);
        assert_eq!(blues(1.0), BLUES[4]);
        assert_eq!(blues(2.0), BLUES[4]);
        assert_eq!(blues(f64::NAN), BLUES[0]);
    }

    #[test]
    fn test_render_has_one_cell_per_entry() {
        let matrix = ConfusionMatrix::from_predictions(&[0, 1, 1], &[0, 1, 0], 2);
        let names = vec!["a<b".to_string(), "happy".to_string()];
        let svg = render_confusion_heatmap(&matrix, &names, "demo");

        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert_eq!(svg.matches("stroke=\"white\"").count(), 4);
        assert!(svg.contains("a&lt;b"));
        assert!(svg.contains("rotate(-45"));
    }

    #[test]
    fn test_save_creates_parent_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results").join("cm.svg");
        let matrix = ConfusionMatrix::from_predictions(&[0], &[0], 1);
        save_confusion_heatmap(&matrix, &["only".to_string()], "one", &path).unwrap();
        assert!(path.exists());
    }
}
