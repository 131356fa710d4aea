pub mod page_allocator;
