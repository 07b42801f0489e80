pub mod result_util;
