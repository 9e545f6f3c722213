//! 🫐欢迎光临🍒
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, Idx3d, Off3d};

pub use crate::data::slice::{MaskSlice, ScanSlice, SliceWriteRaw, SliceWriteVis};
pub use crate::data::window::HuWindow;
pub use crate::data::{MaskVolume, NiftiMeta, ScanVolume, VoiSample, VoiSpec, VolumePair};

pub use crate::consts::gray::{NODULE_BACKGROUND, NODULE_FOREGROUND};
pub use crate::consts::{Malignancy, NoduleType, NUM_NODULE_TYPES, VOI_SHAPE};

pub use crate::dataset::{self, home_dataset_dir_with, home_luna23_dir};
pub use crate::dataset::{CaseIndex, CaseRecord};

pub use crate::augment::{sample_seed, AugmentSpec, Augmenter};

pub use crate::split::{build_split, make_folds, FoldSet, SplitAssignment, SplitSpec, SplitStrategy};

pub use crate::metrics::{balanced_accuracy, dice_coefficient, roc_auc};
