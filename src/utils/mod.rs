pub mod prio_bitmap;
