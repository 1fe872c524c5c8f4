pub mod memcached_impl;
