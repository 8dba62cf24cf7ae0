//! 混同行列と分類レポート

use serde::{Deserialize, Serialize};
use std::fmt;

/// 混同行列（行 = 正解クラス、列 = 予測クラス）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// 正解と予測の列から集計
    ///
    /// 範囲外のクラスIDは数えません。
    pub fn from_predictions(y_true: &[usize], y_pred: &[usize], num_classes: usize) -> Self {
        let mut counts = vec![vec![0; num_classes]; num_classes];
        for (&actual, &predicted) in y_true.iter().zip(y_pred) {
            if actual < num_classes && predicted < num_classes {
                counts[actual][predicted] += 1;
            }
        }
        Self { counts }
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts[actual][predicted]
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }

    /// 各クラスの正解サンプル数
    pub fn row_sums(&self) -> Vec<usize> {
        self.counts.iter().map(|row| row.iter().sum()).collect()
    }

    /// 各クラスとして予測された数
    pub fn column_sums(&self) -> Vec<usize> {
        (0..self.num_classes())
            .map(|col| self.counts.iter().map(|row| row[col]).sum())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn trace(&self) -> usize {
        (0..self.num_classes()).map(|i| self.counts[i][i]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.trace(), self.total())
    }

    pub fn max_count(&self) -> usize {
        self.counts.iter().flatten().copied().max().unwrap_or(0)
    }

    /// クラス名付きのテキスト表
    pub fn render(&self, class_names: &[String]) -> String {
        let width = class_names
            .iter()
            .map(|n| n.len())
            .chain(std::iter::once(self.max_count().to_string().len()))
            .max()
            .unwrap_or(1)
            + 2;

        let mut out = format!("{:>width$}", "", width = width);
        for name in class_names {
            out.push_str(&format!("{:>width$}", name, width = width));
        }
        out.push('\n');

        for (row, name) in self.counts.iter().zip(class_names) {
            out.push_str(&format!("{:>width$}", name, width = width));
            for count in row {
                out.push_str(&format!("{:>width$}", count, width = width));
            }
            out.push('\n');
        }
        out
    }
}

/// 1クラス分の指標
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// 平均値（precision / recall / F1）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AveragedMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// クラス別の precision / recall / F1 と全体の正解率
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: AveragedMetrics,
    pub weighted_avg: AveragedMetrics,
    pub total_support: usize,
}

impl ClassificationReport {
    /// 分母が0になる指標は0として扱う
    pub fn from_confusion(matrix: &ConfusionMatrix, class_names: &[String]) -> Self {
        let supports = matrix.row_sums();
        let predicted = matrix.column_sums();
        let total = matrix.total();

        let classes: Vec<ClassMetrics> = (0..matrix.num_classes())
            .map(|i| {
                let tp = matrix.get(i, i);
                let precision = ratio(tp, predicted[i]);
                let recall = ratio(tp, supports[i]);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    name: class_names
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| i.to_string()),
                    precision,
                    recall,
                    f1,
                    support: supports[i],
                }
            })
            .collect();

        let n = classes.len().max(1) as f64;
        let macro_avg = AveragedMetrics {
            precision: classes.iter().map(|c| c.precision).sum::<f64>() / n,
            recall: classes.iter().map(|c| c.recall).sum::<f64>() / n,
            f1: classes.iter().map(|c| c.f1).sum::<f64>() / n,
        };

        let weight = |f: fn(&ClassMetrics) -> f64| -> f64 {
            if total == 0 {
                return 0.0;
            }
            classes
                .iter()
                .map(|c| f(c) * c.support as f64)
                .sum::<f64>()
                / total as f64
        };
        let weighted_avg = AveragedMetrics {
            precision: weight(|c| c.precision),
            recall: weight(|c| c.recall),
            f1: weight(|c| c.f1),
        };

        Self {
            accuracy: matrix.accuracy(),
            classes,
            macro_avg,
            weighted_avg,
            total_support: total,
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|c| c.name.len())
            .chain(std::iter::once("weighted avg".len()))
            .max()
            .unwrap_or(12);

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "",
            "precision",
            "recall",
            "f1-score",
            "support",
            width = width
        )?;
        writeln!(f)?;

        for c in &self.classes {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                c.name,
                c.precision,
                c.recall,
                c.f1,
                c.support,
                width = width
            )?;
        }
        writeln!(f)?;

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy",
            "",
            "",
            self.accuracy,
            self.total_support,
            width = width
        )?;
        for (label, avg) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                label,
                avg.precision,
                avg.recall,
                avg.f1,
                self.total_support,
                width = width
            )?;
        }
        Ok(())
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
