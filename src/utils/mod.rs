pub mod nethash;
